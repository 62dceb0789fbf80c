//! Agent service: owns both workers and answers administrative calls
//!
//! ## Lifecycle
//!
//! 1. Build with [`AffinityService::new()`]; nothing runs yet
//! 2. [`AffinityService::start()`] spawns the cache worker and the state machine
//! 3. Administrative calls may arrive at any time, before or after start
//! 4. [`AffinityService::shutdown()`] stops both loops, joins them, flushes the store
//!
//! Administrative calls that change the state go through the same
//! transition lock as the state machine tick, so they never interleave
//! with a half-finished evaluation.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{info, warn};

use crate::config::AffinityConfig;
use crate::error::{Error, Result};
use crate::timer::{WakeHandle, WakeableTimer};
use crate::traits::{AffinitizedDc, AffinityState, HaMode, HeartbeatStatus, SuperlogEntry};
use crate::worker::{AffinityStateMachine, AgentContext, CacheRefreshWorker, Collaborators};

/// Cached health of one DC, as reported to administrators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcStatus {
    pub dc_name: String,
    pub site_name: String,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_response_ms: u64,
    pub last_error: Option<String>,
    pub is_alive: bool,
    /// Per-service detail of the last successful heartbeat
    pub heartbeat: Option<HeartbeatStatus>,
}

struct Workers {
    cache: CacheRefreshWorker,
    state_machine: AffinityStateMachine,
}

/// The DC affinity agent
pub struct AffinityService {
    ctx: Arc<AgentContext>,
    cache_wake: WakeHandle,
    state_wake: WakeHandle,
    /// Present until `start` hands them to their tasks
    idle: Mutex<Option<Workers>>,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl AffinityService {
    /// Validate the configuration and wire the workers
    ///
    /// # Errors
    ///
    /// - `Config` if the configuration is invalid
    /// - Store errors while reading the persisted state
    pub async fn new(config: AffinityConfig, collaborators: Collaborators) -> Result<Self> {
        let ctx = Arc::new(AgentContext::build(config, collaborators).await?);

        if ctx.store.get_ha_mode().await?.is_none() {
            let mode = ctx.ha_mode().await?;
            ctx.store.set_ha_mode(mode).await?;
        }

        let cache_timer = WakeableTimer::new("cache-refresh");
        let state_timer = WakeableTimer::new("state-machine");
        let cache_wake = cache_timer.handle();
        let state_wake = state_timer.handle();

        let workers = Workers {
            cache: CacheRefreshWorker::new(Arc::clone(&ctx), cache_timer, state_wake.clone()),
            state_machine: AffinityStateMachine::new(Arc::clone(&ctx), state_timer),
        };

        Ok(Self {
            ctx,
            cache_wake,
            state_wake,
            idle: Mutex::new(Some(workers)),
            running: Mutex::new(Vec::new()),
        })
    }

    /// Spawn both worker loops. Idempotent
    pub async fn start(&self) -> Result<()> {
        let Some(workers) = self.idle.lock().await.take() else {
            return Ok(());
        };
        if self.cache_wake.is_shutdown_requested() {
            return Err(Error::ShuttingDown);
        }

        let mut running = self.running.lock().await;
        running.push(tokio::spawn(workers.state_machine.run()));
        running.push(tokio::spawn(workers.cache.run()));

        info!(
            domain = self.ctx.domain(),
            bootstrap_dc = %self.ctx.bootstrap_dc(),
            "DC affinity service started"
        );
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.iter().any(|h| !h.is_finished())
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Turn affinity on and wait for both workers to re-evaluate
    ///
    /// An inactive agent moves to `NoDcList`; an armed one keeps its state.
    pub async fn enable_affinity(&self) -> Result<()> {
        let ctx = &self.ctx;
        ctx.store.set_ha_mode(HaMode::Default).await?;

        let reset = {
            let held = ctx.lock_transitions().await;
            let state = ctx.current_state().await?;
            match state {
                AffinityState::Disabled => {
                    ctx.commit_transition(&held, AffinityState::Disabled, AffinityState::Legacy)
                        .await?;
                    ctx.commit_transition(&held, AffinityState::Legacy, AffinityState::NoDcList)
                        .await?;
                    true
                }
                AffinityState::Legacy => {
                    ctx.commit_transition(&held, AffinityState::Legacy, AffinityState::NoDcList)
                        .await?;
                    true
                }
                _ => false,
            }
        };

        if reset {
            ctx.cache.purge().await?;
        }
        ctx.request_refresh();
        info!(domain = ctx.domain(), "DC affinity enabled");

        self.cache_wake.wake_and_wait().await?;
        self.state_wake.wake_and_wait().await
    }

    /// Turn affinity off: back to `Legacy`, forget the affinitized DC, empty the cache
    pub async fn disable_affinity(&self) -> Result<()> {
        let ctx = &self.ctx;
        ctx.store.set_ha_mode(HaMode::Legacy).await?;

        {
            let held = ctx.lock_transitions().await;
            let state = ctx.current_state().await?;
            ctx.commit_transition(&held, state, AffinityState::Legacy).await?;
            ctx.store.delete_affinitized_dc(ctx.domain()).await?;
        }

        ctx.cache.purge().await?;
        info!(domain = ctx.domain(), "DC affinity disabled");

        self.cache_wake.wake();
        self.state_wake.wake();
        Ok(())
    }

    pub async fn current_state(&self) -> Result<AffinityState> {
        self.ctx.current_state().await
    }

    /// The DC clients of `domain` should use
    ///
    /// With affinity off, or before a DC was chosen, the bootstrap DC is
    /// reported with no `affinitized_since`.
    ///
    /// # Errors
    ///
    /// - `InvalidDomain` if `domain` is not the managed domain
    pub async fn affinitized_dc(&self, domain: Option<&str>) -> Result<AffinitizedDc> {
        let ctx = &self.ctx;
        if let Some(requested) = domain {
            let requested = requested.trim().trim_end_matches('.');
            if !requested.eq_ignore_ascii_case(ctx.domain()) {
                return Err(Error::invalid_domain(requested));
            }
        }

        if ctx.ha_mode().await? == HaMode::Default {
            if let Some(dc) = ctx.affinitized_dc().await? {
                return Ok(dc);
            }
        }

        Ok(AffinitizedDc {
            dc_name: ctx.bootstrap_dc(),
            domain_name: ctx.domain().to_string(),
            site_name: ctx.client_site().await?.unwrap_or_default(),
            affinitized_since: None,
        })
    }

    /// Re-run discovery now; optionally drop the cache first and wait for both workers
    ///
    /// # Errors
    ///
    /// - `HaDisabled` while affinity is off
    /// - `ShuttingDown` if the service stops while waiting
    pub async fn force_refresh(&self, purge: bool, wait: bool) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.ha_mode().await? != HaMode::Default {
            return Err(Error::HaDisabled);
        }

        if purge {
            ctx.cache.purge().await?;
        }
        ctx.request_refresh();
        info!(purge, wait, "Forced DC cache refresh");

        if wait {
            self.cache_wake.wake_and_wait().await?;
            self.state_wake.wake_and_wait().await
        } else {
            self.cache_wake.wake();
            self.state_wake.wake();
            Ok(())
        }
    }

    /// Names of every cached DC
    pub async fn enumerate_cached_dcs(&self) -> Result<Vec<String>> {
        Ok(self
            .ctx
            .store
            .list_dc_entries(self.ctx.domain())
            .await?
            .into_iter()
            .map(|entry| entry.dc_name)
            .collect())
    }

    /// # Errors
    ///
    /// - `NotFound` if the DC is not cached
    pub async fn dc_status(&self, dc_name: &str) -> Result<DcStatus> {
        let ctx = &self.ctx;
        let entry = ctx
            .cache
            .entry(dc_name)
            .await?
            .ok_or_else(|| Error::not_found(format!("DC {} is not cached", dc_name)))?;
        let heartbeat = ctx.store.get_heartbeat_status(&entry.dc_name).await?;

        Ok(DcStatus {
            dc_name: entry.dc_name,
            site_name: entry.site_name,
            last_ping_at: entry.last_ping_at,
            last_response_ms: entry.last_ping_time_ms,
            last_error: entry.last_error,
            is_alive: entry.is_alive,
            heartbeat,
        })
    }

    /// Current state first, then every committed transition
    pub fn watch_state(&self) -> WatchStream<AffinityState> {
        WatchStream::new(self.ctx.subscribe())
    }

    /// Most recent state machine ticks, newest first
    pub async fn superlog(&self, limit: usize) -> Vec<SuperlogEntry> {
        self.ctx.superlog.recent(limit).await
    }

    /// Stop both workers, wait for them, flush the store
    ///
    /// Pending `wake_and_wait` callers fail with `ShuttingDown`. Probe tasks
    /// still in flight finish on their own and discard their results.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down DC affinity service");
        self.cache_wake.request_shutdown();
        self.state_wake.request_shutdown();

        let handles = std::mem::take(&mut *self.running.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        // Never started: dropping the timers releases any waiters
        self.idle.lock().await.take();

        self.ctx.store.flush().await?;
        info!("DC affinity service stopped");
        Ok(())
    }
}
