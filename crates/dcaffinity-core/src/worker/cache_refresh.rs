//! Cache refresh worker
//!
//! Keeps the DC cache fresh and the alive flags current.
//!
//! ## Tick
//!
//! 1. Skip entirely while affinity is off or the state is inactive.
//! 2. When a refresh is due: SRV discovery through the affinitized DC (the
//!    bootstrap DC if there is none), reconcile, persist the tags. A failed
//!    discovery keeps the persisted list and retries next tick. Reconcile
//!    and persist run under the transition lock after checking again that
//!    affinity is on, so a disable that lands during discovery is never
//!    undone by the rows it returned.
//! 3. Spawn one detached probe task per on-site/active row, plus the
//!    off-site rows on one tick in `offsite_probe_every`. Each task writes
//!    its own result. A dead affinitized DC wakes the state machine.
//!
//! The loop does not join probe tasks, except for a tick that a caller is
//! waiting on through `wake_and_wait`: that tick settles its probes before
//! acknowledging. `tick` hands back the handles either way.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{EntryFilter, PersistReport};
use crate::error::{Error, Result};
use crate::timer::{WakeHandle, WakeReason, WakeableTimer};
use crate::traits::HaMode;
use crate::worker::AgentContext;

/// What one tick did
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Affinity off or state inactive
    pub skipped: bool,
    /// DCs returned by discovery, when discovery ran and succeeded
    pub discovered: Option<usize>,
    pub persisted: PersistReport,
    /// Detached probe tasks launched by this tick
    pub probes: Vec<JoinHandle<()>>,
}

impl RefreshReport {
    /// Wait for every probe task of this tick
    pub async fn settle(self) {
        for probe in self.probes {
            if let Err(e) = probe.await {
                warn!(error = %e, "Probe task did not complete");
            }
        }
    }
}

/// Cache refresh worker
pub struct CacheRefreshWorker {
    ctx: Arc<AgentContext>,
    timer: WakeableTimer,
    state_machine: WakeHandle,
    next_full_refresh: Instant,
    offsite_counter: u32,
}

impl CacheRefreshWorker {
    pub fn new(ctx: Arc<AgentContext>, timer: WakeableTimer, state_machine: WakeHandle) -> Self {
        let next_full_refresh = Instant::now() + ctx.config.timing.refresh_interval();
        Self {
            ctx,
            timer,
            state_machine,
            next_full_refresh,
            offsite_counter: 0,
        }
    }

    /// Run until shutdown
    pub async fn run(mut self) {
        let heartbeat = self.ctx.config.timing.heartbeat_interval();
        let refresh = self.ctx.config.timing.refresh_interval();
        let shutdown = self.timer.handle();
        self.timer.attach();
        info!(heartbeat = ?heartbeat, refresh = ?refresh, "Cache refresh worker started");

        loop {
            if shutdown.is_shutdown_requested() {
                break;
            }

            self.timer.begin_tick();
            match self.tick().await {
                Ok(report) if report.skipped => debug!("Cache refresh skipped"),
                Ok(report) => {
                    debug!(
                        discovered = ?report.discovered,
                        probes = report.probes.len(),
                        "Cache refresh tick finished"
                    );
                    if self.timer.has_waiters() {
                        report.settle().await;
                    }
                }
                Err(e) => error!(error = %e, "Cache refresh tick failed"),
            }
            self.timer.finish_tick();

            let deadline = (Instant::now() + heartbeat).min(self.next_full_refresh);
            if self.timer.sleep_until(deadline).await == WakeReason::Shutdown {
                break;
            }

            let now = Instant::now();
            if now >= self.next_full_refresh {
                self.ctx.request_refresh();
                self.next_full_refresh = now + refresh;
            }
        }

        self.timer.close();
        info!("Cache refresh worker stopped");
    }

    /// One refresh-and-probe pass
    pub async fn tick(&mut self) -> Result<RefreshReport> {
        let ctx = Arc::clone(&self.ctx);
        let mut report = RefreshReport::default();

        if !affinity_active(&ctx).await? {
            report.skipped = true;
            return Ok(report);
        }

        if ctx.take_refresh_request() {
            match self.refresh_cache().await {
                Ok(Some((discovered, persisted))) => {
                    report.discovered = Some(discovered);
                    report.persisted = persisted;
                }
                Ok(None) => {
                    debug!("Affinity turned off during discovery, dropping the result");
                    report.skipped = true;
                    return Ok(report);
                }
                Err(e) => {
                    warn!(error = %e, "DC discovery failed, probing the cached list");
                    ctx.request_refresh();
                }
            }
        }

        report.probes = self.dispatch_probes().await?;
        Ok(report)
    }

    /// `None` when affinity was turned off while discovery ran
    async fn refresh_cache(&self) -> Result<Option<(usize, PersistReport)>> {
        let ctx = &self.ctx;
        let server = match ctx.affinitized_dc().await? {
            Some(dc) => dc.dc_name,
            None => ctx.bootstrap_dc(),
        };
        if server.is_empty() {
            return Err(Error::config("No DC to query for discovery"));
        }

        ctx.reachability
            .check(&server, ctx.config.probe.dns_port, ctx.config.probe.timeout())
            .await?;

        let names = ctx
            .bounded(
                "DC discovery",
                ctx.discovery.discover_dcs(&server, ctx.domain()),
            )
            .await?;

        let _held = ctx.lock_transitions().await;
        if !affinity_active(ctx).await? {
            return Ok(None);
        }

        let tagged = ctx
            .cache
            .reconcile_with_discovered(&names, ctx.probe.as_ref())
            .await?;
        let persisted = ctx.cache.persist(&tagged).await;

        info!(
            server = %server,
            via = ctx.discovery.discovery_name(),
            discovered = names.len(),
            inserted = persisted.inserted,
            updated = persisted.updated,
            failed = persisted.failed,
            "DC cache refreshed"
        );
        Ok(Some((names.len(), persisted)))
    }

    async fn dispatch_probes(&mut self) -> Result<Vec<JoinHandle<()>>> {
        let ctx = &self.ctx;
        let client_site = ctx.client_site().await?;

        let mut targets = ctx
            .cache
            .enumerate(EntryFilter::OnSiteAndActive, client_site.as_deref())
            .await?;
        if self.offsite_counter == 0 {
            targets.extend(
                ctx.cache
                    .enumerate(EntryFilter::OffSite, client_site.as_deref())
                    .await?,
            );
        }
        self.offsite_counter = (self.offsite_counter + 1) % ctx.config.timing.offsite_probe_every.max(1);

        let affinitized = ctx.affinitized_dc().await?.map(|dc| dc.dc_name);

        let probes = targets
            .into_iter()
            .map(|entry| {
                let is_affinitized = affinitized
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(&entry.dc_name));
                tokio::spawn(probe_and_record(
                    Arc::clone(&self.ctx),
                    entry.dc_name,
                    is_affinitized,
                    self.timer.handle(),
                    self.state_machine.clone(),
                ))
            })
            .collect();

        Ok(probes)
    }
}

async fn affinity_active(ctx: &AgentContext) -> Result<bool> {
    Ok(ctx.ha_mode().await? == HaMode::Default && ctx.current_state().await?.is_armed())
}

/// Body of one detached probe task
async fn probe_and_record(
    ctx: Arc<AgentContext>,
    dc_name: String,
    is_affinitized: bool,
    worker: WakeHandle,
    state_machine: WakeHandle,
) {
    let outcome = ctx.probe.probe(&dc_name, ctx.domain()).await;

    if worker.is_shutdown_requested() {
        debug!(dc = %dc_name, "Shutdown in progress, discarding probe result");
        return;
    }

    match ctx.cache.record_probe(&outcome).await {
        Ok(_) => {}
        Err(Error::NotFound(_)) => {
            debug!(dc = %dc_name, "DC row removed while probing");
            return;
        }
        Err(e) => {
            warn!(dc = %dc_name, error = %e, "Failed to record probe result");
        }
    }

    if is_affinitized && !outcome.alive {
        warn!(dc = %dc_name, "Affinitized DC failed its probe");
        ctx.log_dc_failure(&dc_name).await;
        state_machine.wake();
    }
}
