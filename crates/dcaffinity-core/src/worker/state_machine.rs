//! Affinity state machine
//!
//! Ticks on its own timer (and on demand), reads the persisted state and
//! the DC cache, and decides whether the client should move to another DC.
//!
//! ## Transition table
//!
//! | next            | valid from                          |
//! |-----------------|-------------------------------------|
//! | Legacy          | any state                           |
//! | NoDcList        | Legacy                              |
//! | SiteAffinitized | NoDcList, OffSite, NoDcsAlive       |
//! | OffSite         | OffSite, NoDcsAlive, SiteAffinitized|
//! | NoDcsAlive      | OffSite, NoDcsAlive, SiteAffinitized|
//!
//! Same-state requests always succeed and write nothing.
//!
//! ## Per-state handling
//!
//! - `Legacy`: upgrade to `NoDcList` when the domain supports affinity,
//!   then tick again at once.
//! - `Disabled`: inactive.
//! - `NoDcList`: probe the bootstrap DC and affinitize to it. An off-site
//!   bootstrap DC lands in `SiteAffinitized` with a forced re-pick on an
//!   immediate second tick, which moves it to `OffSite`.
//! - `SiteAffinitized`: keep the DC while it is alive, except on the first
//!   tick after startup; otherwise run the selection cascade.
//! - `OffSite`: always re-run the cascade; stay only if it returns the
//!   same DC.
//! - `NoDcsAlive`: re-run the cascade until something answers.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::timer::{WakeHandle, WakeReason, WakeableTimer};
use crate::traits::{AffinityState, DcCacheEntry, HaMode, SuperlogEntry};
use crate::worker::AgentContext;

/// Whether `from -> to` is in the transition table
pub fn is_valid_transition(from: AffinityState, to: AffinityState) -> bool {
    use AffinityState::*;

    if from == to {
        return true;
    }

    match to {
        Legacy => true,
        NoDcList => from == Legacy,
        SiteAffinitized => matches!(from, NoDcList | OffSite | NoDcsAlive),
        OffSite | NoDcsAlive => matches!(from, OffSite | NoDcsAlive | SiteAffinitized),
        Disabled => false,
    }
}

/// Validate and commit a transition from whatever state is persisted
///
/// # Errors
///
/// - `InvalidTransition` if the pair is not in the table; nothing is written
pub async fn transition(ctx: &AgentContext, to: AffinityState) -> Result<bool> {
    let held = ctx.lock_transitions().await;
    let from = ctx.current_state().await?;
    ctx.commit_transition(&held, from, to).await
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub from: AffinityState,
    pub to: AffinityState,
    /// Affinitized DC after the tick
    pub dc_name: Option<String>,
    /// Run the next tick without sleeping
    pub retick: bool,
    /// Affinity is off; nothing was evaluated
    pub skipped: bool,
}

impl TickOutcome {
    fn stay(state: AffinityState, dc_name: Option<String>) -> Self {
        Self {
            from: state,
            to: state,
            dc_name,
            retick: false,
            skipped: false,
        }
    }

    fn moved(from: AffinityState, to: AffinityState, dc_name: Option<String>) -> Self {
        Self {
            from,
            to,
            dc_name,
            retick: false,
            skipped: false,
        }
    }
}

/// State machine worker
pub struct AffinityStateMachine {
    ctx: Arc<AgentContext>,
    timer: WakeableTimer,
    /// Set at startup and after an off-site bootstrap; consumed by the next tick
    repick_pending: bool,
}

impl AffinityStateMachine {
    pub fn new(ctx: Arc<AgentContext>, timer: WakeableTimer) -> Self {
        Self {
            ctx,
            timer,
            repick_pending: true,
        }
    }

    /// Handle for waking this machine out of its sleep
    pub fn wake_handle(&self) -> WakeHandle {
        self.timer.handle()
    }

    /// Run until shutdown
    pub async fn run(mut self) {
        let interval = self.ctx.config.timing.heartbeat_interval();
        let shutdown = self.timer.handle();
        self.timer.attach();
        info!(interval = ?interval, "State machine started");

        loop {
            if shutdown.is_shutdown_requested() {
                break;
            }

            self.timer.begin_tick();
            let retick = match self.tick().await {
                Ok(outcome) => outcome.retick,
                Err(e) => {
                    error!(error = %e, "State machine tick failed");
                    false
                }
            };
            self.timer.finish_tick();

            if retick {
                continue;
            }

            if self.timer.sleep_until(Instant::now() + interval).await == WakeReason::Shutdown {
                break;
            }
        }

        self.timer.close();
        info!("State machine stopped");
    }

    /// One evaluation; records a superlog entry unless affinity is off
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let started_at = Utc::now();
        let repick = std::mem::replace(&mut self.repick_pending, false);

        let result = self.dispatch(repick).await;

        if !matches!(&result, Ok(outcome) if outcome.skipped) {
            self.record_superlog(started_at, &result).await;
        }
        result
    }

    async fn dispatch(&mut self, repick: bool) -> Result<TickOutcome> {
        let ctx = Arc::clone(&self.ctx);

        // HA mode and state must be read under the lock disable also takes
        let held = ctx.lock_transitions().await;
        let state = ctx.current_state().await?;
        if ctx.ha_mode().await? != HaMode::Default {
            debug!(%state, "Affinity disabled, skipping tick");
            let mut outcome = TickOutcome::stay(state, None);
            outcome.skipped = true;
            return Ok(outcome);
        }
        debug!(%state, repick, "State machine tick");

        match state {
            AffinityState::Legacy => self.handle_legacy(&ctx, &held).await,
            AffinityState::Disabled => Ok(TickOutcome::stay(state, None)),
            AffinityState::NoDcList => self.handle_no_dc_list(&ctx, &held).await,
            AffinityState::SiteAffinitized => self.handle_site_affinitized(&ctx, &held, repick).await,
            AffinityState::OffSite => self.handle_off_site(&ctx, &held).await,
            AffinityState::NoDcsAlive => {
                let current = ctx.affinitized_dc().await?.map(|dc| dc.dc_name);
                let pick = pick_new_dc(&ctx).await?;
                apply_pick(&ctx, &held, state, pick, current).await
            }
        }
    }

    async fn handle_legacy(&mut self, ctx: &AgentContext, held: &MutexGuard<'_, ()>) -> Result<TickOutcome> {
        let bootstrap = ctx.bootstrap_dc();
        let supported = ctx
            .bounded(
                "functional level query",
                ctx.directory
                    .supports_affinity(&bootstrap, ctx.domain(), &ctx.config.credentials),
            )
            .await?;

        if !supported {
            debug!(domain = ctx.domain(), "Domain functional level does not support affinity");
            return Ok(TickOutcome::stay(AffinityState::Legacy, None));
        }

        ctx.commit_transition(held, AffinityState::Legacy, AffinityState::NoDcList)
            .await?;
        info!(domain = ctx.domain(), "Domain supports affinity, leaving legacy mode");

        let mut outcome = TickOutcome::moved(AffinityState::Legacy, AffinityState::NoDcList, None);
        outcome.retick = true;
        Ok(outcome)
    }

    async fn handle_no_dc_list(&mut self, ctx: &AgentContext, held: &MutexGuard<'_, ()>) -> Result<TickOutcome> {
        let bootstrap = ctx.bootstrap_dc();
        if bootstrap.is_empty() {
            return Err(Error::config("No bootstrap DC configured"));
        }

        let outcome = ctx.probe.probe(&bootstrap, ctx.domain()).await;
        let entry = ctx.cache.adopt_probe(&outcome).await?;

        if !outcome.alive {
            warn!(
                dc = %bootstrap,
                error = outcome.last_error.as_deref().unwrap_or("unknown"),
                "Bootstrap DC is not alive"
            );
            return Ok(TickOutcome::stay(AffinityState::NoDcList, None));
        }

        let client_site = match ctx.client_site().await? {
            Some(site) => Some(site),
            None if entry.has_site() => {
                ctx.store.set_client_site(&entry.site_name).await?;
                info!(site = %entry.site_name, "Adopted site of bootstrap DC as client site");
                Some(entry.site_name.clone())
            }
            None => None,
        };

        let on_site = !entry.has_site() || client_site.as_deref().is_none_or(|site| entry.is_in_site(site));

        ctx.affinitize(&entry).await?;
        ctx.commit_transition(held, AffinityState::NoDcList, AffinityState::SiteAffinitized)
            .await?;

        let mut result = TickOutcome::moved(
            AffinityState::NoDcList,
            AffinityState::SiteAffinitized,
            Some(entry.dc_name.clone()),
        );
        if !on_site {
            info!(dc = %entry.dc_name, site = %entry.site_name, "Bootstrap DC is off-site, re-evaluating");
            self.repick_pending = true;
            result.retick = true;
        }
        Ok(result)
    }

    async fn handle_site_affinitized(
        &mut self,
        ctx: &AgentContext,
        held: &MutexGuard<'_, ()>,
        repick: bool,
    ) -> Result<TickOutcome> {
        let current = ctx.affinitized_dc().await?.map(|dc| dc.dc_name);
        let alive = match &current {
            Some(name) => ctx.cache.is_alive(name).await?,
            None => false,
        };

        if alive && !repick {
            return Ok(TickOutcome::stay(AffinityState::SiteAffinitized, current));
        }

        if !alive {
            if let Some(name) = &current {
                warn!(dc = %name, "Affinitized DC is down");
                ctx.log_dc_failure(name).await;
            }
        }

        let pick = pick_new_dc(ctx).await?;
        apply_pick(ctx, held, AffinityState::SiteAffinitized, pick, current).await
    }

    async fn handle_off_site(&mut self, ctx: &AgentContext, held: &MutexGuard<'_, ()>) -> Result<TickOutcome> {
        let current = ctx.affinitized_dc().await?.map(|dc| dc.dc_name);
        let pick = pick_new_dc(ctx).await?;

        if let Some((entry, AffinityState::OffSite)) = &pick {
            let same = current
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(&entry.dc_name));
            if same && entry.is_alive {
                return Ok(TickOutcome::stay(AffinityState::OffSite, current));
            }
        }

        apply_pick(ctx, held, AffinityState::OffSite, pick, current).await
    }

    async fn record_superlog(&self, started_at: chrono::DateTime<Utc>, result: &Result<TickOutcome>) {
        let ctx = &self.ctx;
        let affinitized = ctx.affinitized_dc().await.ok().flatten();
        let state = match result {
            Ok(outcome) => outcome.to,
            Err(_) => ctx.current_state().await.unwrap_or(AffinityState::Legacy),
        };

        ctx.superlog
            .record(SuperlogEntry {
                started_at,
                finished_at: Utc::now(),
                domain_name: ctx.domain().to_string(),
                dc_name: affinitized.as_ref().map(|dc| dc.dc_name.clone()),
                site_name: affinitized.map(|dc| dc.site_name),
                state,
                error: result.as_ref().err().map(|e| e.to_string()),
            })
            .await;
    }
}

/// Selection cascade: closest on-site, then closest anywhere, then nothing
pub async fn pick_new_dc(ctx: &AgentContext) -> Result<Option<(DcCacheEntry, AffinityState)>> {
    if let Some(site) = ctx.client_site().await? {
        match ctx.cache.closest_on_site(&site).await {
            Ok(entry) => return Ok(Some((entry, AffinityState::SiteAffinitized))),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    match ctx.cache.closest_any().await {
        Ok(entry) => Ok(Some((entry, AffinityState::OffSite))),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Persist the cascade's pick and transition to its state
async fn apply_pick(
    ctx: &AgentContext,
    held: &MutexGuard<'_, ()>,
    from: AffinityState,
    pick: Option<(DcCacheEntry, AffinityState)>,
    current: Option<String>,
) -> Result<TickOutcome> {
    match pick {
        Some((entry, next)) => {
            ctx.affinitize(&entry).await?;
            ctx.commit_transition(held, from, next).await?;
            Ok(TickOutcome::moved(from, next, Some(entry.dc_name)))
        }
        None => {
            if from != AffinityState::NoDcsAlive {
                warn!(domain = ctx.domain(), "No DC is alive");
                ctx.log_all_dc_states().await;
            }
            ctx.commit_transition(held, from, AffinityState::NoDcsAlive)
                .await?;
            Ok(TickOutcome::moved(from, AffinityState::NoDcsAlive, current))
        }
    }
}
