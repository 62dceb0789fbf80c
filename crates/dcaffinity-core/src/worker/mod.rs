//! Background workers and the context they share
//!
//! ```text
//!                 ┌───────────────────────┐
//!                 │     AgentContext      │  config, collaborators,
//!                 │  (Arc, shared by all) │  transition lock, state watch
//!                 └───────────┬───────────┘
//!            ┌────────────────┴────────────────┐
//!            ▼                                 ▼
//! ┌─────────────────────┐   wake on   ┌──────────────────────┐
//! │ CacheRefreshWorker  │────────────▶│ AffinityStateMachine │
//! │ discover, reconcile,│  affinitized│ pick DC, transition  │
//! │ fan-out probes      │   DC death  │                      │
//! └─────────────────────┘             └──────────────────────┘
//!            │                                 │
//!            └──────────── CacheStore ─────────┘
//! ```
//!
//! The two loops share nothing but the store, the context and a wake handle.

pub mod cache_refresh;
pub mod state_machine;

pub use cache_refresh::{CacheRefreshWorker, RefreshReport};
pub use state_machine::{AffinityStateMachine, TickOutcome, is_valid_transition};

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{info, warn};

use crate::cache::{DcCache, normalize_dc_name};
use crate::config::AffinityConfig;
use crate::error::{Error, Result};
use crate::probe::{HealthProbe, TcpReachability};
use crate::superlog::MemorySuperlog;
use crate::traits::{
    AffinitizedDc, AffinityState, CacheStore, DcCacheEntry, DcDiscovery, DirectoryClient, HaMode,
    HeartbeatClient, Reachability, Superlog,
};

/// The collaborators an agent is built from
///
/// Reachability defaults to a real TCP connect and the superlog to an
/// in-memory ring sized by the configuration.
pub struct Collaborators {
    pub store: Arc<dyn CacheStore>,
    pub discovery: Arc<dyn DcDiscovery>,
    pub heartbeat: Arc<dyn HeartbeatClient>,
    pub directory: Arc<dyn DirectoryClient>,
    pub reachability: Arc<dyn Reachability>,
    pub superlog: Option<Arc<dyn Superlog>>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn CacheStore>,
        discovery: Arc<dyn DcDiscovery>,
        heartbeat: Arc<dyn HeartbeatClient>,
        directory: Arc<dyn DirectoryClient>,
    ) -> Self {
        Self {
            store,
            discovery,
            heartbeat,
            directory,
            reachability: Arc::new(TcpReachability),
            superlog: None,
        }
    }

    pub fn with_reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = reachability;
        self
    }

    pub fn with_superlog(mut self, superlog: Arc<dyn Superlog>) -> Self {
        self.superlog = Some(superlog);
        self
    }
}

/// State shared by both workers and the administrative surface
pub struct AgentContext {
    pub config: AffinityConfig,
    pub store: Arc<dyn CacheStore>,
    pub cache: DcCache,
    pub probe: Arc<HealthProbe>,
    pub discovery: Arc<dyn DcDiscovery>,
    pub directory: Arc<dyn DirectoryClient>,
    pub reachability: Arc<dyn Reachability>,
    pub superlog: Arc<dyn Superlog>,
    refresh_requested: AtomicBool,
    transitions: Mutex<()>,
    state_tx: watch::Sender<AffinityState>,
}

impl AgentContext {
    /// Wire the collaborators together; reads the persisted state once
    pub async fn build(config: AffinityConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let Collaborators {
            store,
            discovery,
            heartbeat,
            directory,
            reachability,
            superlog,
        } = collaborators;

        let probe = Arc::new(HealthProbe::new(
            heartbeat,
            Arc::clone(&directory),
            Arc::clone(&reachability),
            config.credentials.clone(),
            &config.probe,
        ));
        let superlog =
            superlog.unwrap_or_else(|| Arc::new(MemorySuperlog::new(config.superlog_capacity)));
        let initial_state = store.get_state().await?.unwrap_or(AffinityState::Legacy);
        let cache = DcCache::new(Arc::clone(&store), config.domain.clone());
        let (state_tx, _) = watch::channel(initial_state);

        Ok(Self {
            config,
            store,
            cache,
            probe,
            discovery,
            directory,
            reachability,
            superlog,
            refresh_requested: AtomicBool::new(true),
            transitions: Mutex::new(()),
            state_tx,
        })
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn bootstrap_dc(&self) -> String {
        normalize_dc_name(&self.config.bootstrap_dc)
    }

    /// Stored HA mode, or the configured default
    pub async fn ha_mode(&self) -> Result<HaMode> {
        let default = if self.config.ha_enabled { HaMode::Default } else { HaMode::Legacy };
        Ok(self.store.get_ha_mode().await?.unwrap_or(default))
    }

    /// A store with no state recorded reads as `Legacy`
    pub async fn current_state(&self) -> Result<AffinityState> {
        Ok(self.store.get_state().await?.unwrap_or(AffinityState::Legacy))
    }

    /// Learned client site, or the configured one
    pub async fn client_site(&self) -> Result<Option<String>> {
        let stored = self.store.get_client_site().await?;
        Ok(stored
            .filter(|s| !s.is_empty())
            .or_else(|| self.config.site_name.clone().filter(|s| !s.is_empty())))
    }

    pub async fn affinitized_dc(&self) -> Result<Option<AffinitizedDc>> {
        self.store.get_affinitized_dc(self.domain()).await
    }

    /// Point the agent at `entry`, keeping the original timestamp if the DC is unchanged
    pub async fn affinitize(&self, entry: &DcCacheEntry) -> Result<()> {
        let current = self.affinitized_dc().await?;
        let same_dc = current
            .as_ref()
            .is_some_and(|c| c.dc_name.eq_ignore_ascii_case(&entry.dc_name));
        if same_dc && current.as_ref().is_some_and(|c| c.site_name == entry.site_name) {
            return Ok(());
        }

        let since = current
            .filter(|_| same_dc)
            .and_then(|c| c.affinitized_since)
            .unwrap_or_else(Utc::now);
        let record = AffinitizedDc {
            dc_name: entry.dc_name.clone(),
            domain_name: self.config.domain.clone(),
            site_name: entry.site_name.clone(),
            affinitized_since: Some(since),
        };
        self.store.set_affinitized_dc(&record).await?;
        info!(dc = %record.dc_name, site = %record.site_name, "Affinitized to DC");
        Ok(())
    }

    /// Ask the cache worker to run discovery on its next tick
    pub fn request_refresh(&self) {
        self.refresh_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_refresh_request(&self) -> bool {
        self.refresh_requested.swap(false, Ordering::SeqCst)
    }

    /// Serializes every read-modify-write of the affinity state
    pub async fn lock_transitions(&self) -> MutexGuard<'_, ()> {
        self.transitions.lock().await
    }

    /// Validate and commit `from -> to`; the caller holds the transition lock
    ///
    /// Same-state requests succeed without writing. Returns whether a write happened.
    pub(crate) async fn commit_transition(
        &self,
        _held: &MutexGuard<'_, ()>,
        from: AffinityState,
        to: AffinityState,
    ) -> Result<bool> {
        if from == to {
            return Ok(false);
        }
        if !is_valid_transition(from, to) {
            return Err(Error::invalid_transition(from, to));
        }

        self.store.set_state(to).await?;
        self.state_tx.send_replace(to);
        info!(%from, %to, "Affinity state changed");
        Ok(true)
    }

    pub fn subscribe(&self) -> watch::Receiver<AffinityState> {
        self.state_tx.subscribe()
    }

    /// Bound a collaborator call by the probe timeout
    pub async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.probe.timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "{} exceeded {:?}",
                what,
                self.config.probe.timeout()
            ))),
        }
    }

    /// Log a DC's last probe result and failed services
    pub async fn log_dc_failure(&self, dc_name: &str) {
        let entry = match self.cache.entry(dc_name).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                warn!(dc = dc_name, "DC has no cache row");
                return;
            }
            Err(e) => {
                warn!(dc = dc_name, error = %e, "Failed to read DC cache row");
                return;
            }
        };

        let failed: Vec<String> = match self.store.get_heartbeat_status(dc_name).await {
            Ok(Some(status)) => status.failed_services().map(str::to_string).collect(),
            _ => Vec::new(),
        };

        warn!(
            dc = %entry.dc_name,
            site = %entry.site_name,
            alive = entry.is_alive,
            last_ping_ms = entry.last_ping_time_ms,
            last_error = entry.last_error.as_deref().unwrap_or("none"),
            failed_services = ?failed,
            "DC status"
        );
    }

    pub async fn log_all_dc_states(&self) {
        match self.store.list_dc_entries(self.domain()).await {
            Ok(rows) => {
                for row in rows {
                    self.log_dc_failure(&row.dc_name).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to enumerate DC cache"),
        }
    }
}
