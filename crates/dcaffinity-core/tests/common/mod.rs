//! Test doubles and common utilities for contract tests
//!
//! Every double counts its calls so tests can assert on what the agent
//! actually did, not only on where it ended up.

#![allow(dead_code)]

use async_trait::async_trait;
use dcaffinity_core::config::{AffinityConfig, MachineCredentials};
use dcaffinity_core::error::{Error, Result};
use dcaffinity_core::timer::{WakeHandle, WakeableTimer};
use dcaffinity_core::traits::{
    AffinitizedDc, AffinityState, CacheStore, DcCacheEntry, DcDiscovery, DirectoryClient, HaMode,
    HeartbeatClient, HeartbeatStatus, Reachability, ServiceHeartbeat,
};
use dcaffinity_core::{
    AffinityStateMachine, AgentContext, CacheRefreshWorker, Collaborators, MemoryCacheStore,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const DOMAIN: &str = "corp.example.com";

/// Fully qualified DC name in the test domain
pub fn dc(short: &str) -> String {
    format!("{}.{}", short, DOMAIN)
}

/// Configuration with a short probe timeout and long sleeps
///
/// The loops only tick when woken, so tests drive every step.
pub fn minimal_config(bootstrap: &str, site: Option<&str>) -> AffinityConfig {
    let mut config = AffinityConfig::new(DOMAIN, dc(bootstrap))
        .with_credentials(MachineCredentials::new("HOST$", "secret"));
    config.site_name = site.map(str::to_string);
    config.probe.timeout_ms = 200;
    config.timing.heartbeat_interval_secs = 3600;
    config.timing.refresh_interval_secs = 3600;
    config.timing.offsite_probe_every = 1;
    config
}

/// DNS discovery returning a list the test controls
pub struct ScriptedDiscovery {
    names: Mutex<Vec<String>>,
    failing: AtomicBool,
    calls: Arc<AtomicUsize>,
    gate: Mutex<Option<Arc<Notify>>>,
    entered: Arc<Notify>,
}

impl ScriptedDiscovery {
    pub fn new(shorts: &[&str]) -> Self {
        Self {
            names: Mutex::new(shorts.iter().map(|s| format!("{}.", dc(s))).collect()),
            failing: AtomicBool::new(false),
            calls: Arc::new(AtomicUsize::new(0)),
            gate: Mutex::new(None),
            entered: Arc::new(Notify::new()),
        }
    }

    /// Make the next queries block until the returned gate is notified
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Resolves once a query is blocked on the gate
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn set(&self, shorts: &[&str]) {
        *self.names.lock().unwrap() = shorts.iter().map(|s| format!("{}.", dc(s))).collect();
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DcDiscovery for ScriptedDiscovery {
    async fn discover_dcs(&self, _server: &str, _domain: &str) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::discovery("SRV query refused"));
        }
        Ok(self.names.lock().unwrap().clone())
    }

    fn discovery_name(&self) -> &'static str {
        "scripted"
    }
}

/// How a DC answers the heartbeat RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcBehavior {
    /// Answers alive after `delay_ms`
    Alive { delay_ms: u64 },
    /// Answers, but reports a failed service
    Dead,
    /// Transport error
    Fail,
    /// Never answers within any reasonable timeout
    Hang,
}

impl DcBehavior {
    pub const ALIVE: DcBehavior = DcBehavior::Alive { delay_ms: 0 };
}

/// Heartbeat RPC whose answer is set per DC; unknown DCs fail
#[derive(Default)]
pub struct ControlledHeartbeat {
    behavior: Mutex<HashMap<String, DcBehavior>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ControlledHeartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, short: &str, behavior: DcBehavior) {
        self.behavior.lock().unwrap().insert(dc(short), behavior);
    }

    pub fn calls_for(&self, short: &str) -> usize {
        self.calls.lock().unwrap().get(&dc(short)).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl HeartbeatClient for ControlledHeartbeat {
    async fn heartbeat(&self, dc_name: &str, _credentials: &MachineCredentials) -> Result<HeartbeatStatus> {
        *self.calls.lock().unwrap().entry(dc_name.to_string()).or_default() += 1;
        let behavior = self.behavior.lock().unwrap().get(dc_name).copied();

        match behavior {
            Some(DcBehavior::Alive { delay_ms }) => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(HeartbeatStatus::alive().with_service(ServiceHeartbeat {
                    service_name: "netlogon".to_string(),
                    is_alive: true,
                    last_heartbeat_secs: 1,
                }))
            }
            Some(DcBehavior::Dead) => Ok(HeartbeatStatus::dead().with_service(ServiceHeartbeat {
                service_name: "netlogon".to_string(),
                is_alive: false,
                last_heartbeat_secs: 900,
            })),
            Some(DcBehavior::Hang) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(Error::heartbeat("hung"))
            }
            Some(DcBehavior::Fail) | None => Err(Error::heartbeat(format!("{}: RPC server unavailable", dc_name))),
        }
    }
}

/// Directory answering from a fixed site map
pub struct MockDirectory {
    sites: Mutex<HashMap<String, String>>,
    supports: AtomicBool,
    site_calls: Arc<AtomicUsize>,
}

impl MockDirectory {
    pub fn new(sites: &[(&str, &str)]) -> Self {
        Self {
            sites: Mutex::new(sites.iter().map(|(d, s)| (dc(d), s.to_string())).collect()),
            supports: AtomicBool::new(true),
            site_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_site(&self, short: &str, site: &str) {
        self.sites.lock().unwrap().insert(dc(short), site.to_string());
    }

    pub fn set_supports_affinity(&self, supports: bool) {
        self.supports.store(supports, Ordering::SeqCst);
    }

    pub fn site_call_count(&self) -> usize {
        self.site_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryClient for MockDirectory {
    async fn site_name(&self, dc_name: &str, _domain: &str, _credentials: &MachineCredentials) -> Result<String> {
        self.site_calls.fetch_add(1, Ordering::SeqCst);
        self.sites
            .lock()
            .unwrap()
            .get(dc_name)
            .cloned()
            .ok_or_else(|| Error::directory(format!("no site for {}", dc_name)))
    }

    async fn supports_affinity(&self, _dc_name: &str, _domain: &str, _credentials: &MachineCredentials) -> Result<bool> {
        Ok(self.supports.load(Ordering::SeqCst))
    }
}

/// Every host accepts connections
pub struct AlwaysReachable;

#[async_trait]
impl Reachability for AlwaysReachable {
    async fn check(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Memory store that counts state writes and flushes
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryCacheStore,
    state_writes: AtomicUsize,
    flushes: AtomicUsize,
    ha_mode_delay_ms: AtomicU64,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_writes(&self) -> usize {
        self.state_writes.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Stall every HA mode read after the value is taken
    pub fn delay_ha_mode_reads(&self, ms: u64) {
        self.ha_mode_delay_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStore for CountingStore {
    async fn get_ha_mode(&self) -> Result<Option<HaMode>> {
        let mode = self.inner.get_ha_mode().await;
        let delay = self.ha_mode_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        mode
    }

    async fn set_ha_mode(&self, mode: HaMode) -> Result<()> {
        self.inner.set_ha_mode(mode).await
    }

    async fn get_state(&self) -> Result<Option<AffinityState>> {
        self.inner.get_state().await
    }

    async fn set_state(&self, state: AffinityState) -> Result<()> {
        self.state_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set_state(state).await
    }

    async fn get_client_site(&self) -> Result<Option<String>> {
        self.inner.get_client_site().await
    }

    async fn set_client_site(&self, site: &str) -> Result<()> {
        self.inner.set_client_site(site).await
    }

    async fn get_affinitized_dc(&self, domain: &str) -> Result<Option<AffinitizedDc>> {
        self.inner.get_affinitized_dc(domain).await
    }

    async fn set_affinitized_dc(&self, dc: &AffinitizedDc) -> Result<()> {
        self.inner.set_affinitized_dc(dc).await
    }

    async fn delete_affinitized_dc(&self, domain: &str) -> Result<()> {
        self.inner.delete_affinitized_dc(domain).await
    }

    async fn list_dc_entries(&self, domain: &str) -> Result<Vec<DcCacheEntry>> {
        self.inner.list_dc_entries(domain).await
    }

    async fn get_dc_entry(&self, dc_name: &str) -> Result<Option<DcCacheEntry>> {
        self.inner.get_dc_entry(dc_name).await
    }

    async fn insert_dc_entry(&self, entry: &DcCacheEntry) -> Result<()> {
        self.inner.insert_dc_entry(entry).await
    }

    async fn update_dc_entry(&self, entry: &DcCacheEntry) -> Result<()> {
        self.inner.update_dc_entry(entry).await
    }

    async fn delete_dc_entry(&self, dc_name: &str) -> Result<()> {
        self.inner.delete_dc_entry(dc_name).await
    }

    async fn purge_dc_entries(&self) -> Result<()> {
        self.inner.purge_dc_entries().await
    }

    async fn get_heartbeat_status(&self, dc_name: &str) -> Result<Option<HeartbeatStatus>> {
        self.inner.get_heartbeat_status(dc_name).await
    }

    async fn set_heartbeat_status(&self, dc_name: &str, status: &HeartbeatStatus) -> Result<()> {
        self.inner.set_heartbeat_status(dc_name, status).await
    }

    async fn delete_heartbeat_status(&self, dc_name: &str) -> Result<()> {
        self.inner.delete_heartbeat_status(dc_name).await
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.inner.flush().await
    }
}

/// One set of doubles, shared between the agent and the test
pub struct Fixture {
    pub store: Arc<CountingStore>,
    pub discovery: Arc<ScriptedDiscovery>,
    pub heartbeat: Arc<ControlledHeartbeat>,
    pub directory: Arc<MockDirectory>,
}

impl Fixture {
    /// `dcs` are (short name, site); all of them start alive
    pub fn new(dcs: &[(&str, &str)]) -> Self {
        let shorts: Vec<&str> = dcs.iter().map(|(d, _)| *d).collect();
        let heartbeat = ControlledHeartbeat::new();
        for short in &shorts {
            heartbeat.set(short, DcBehavior::ALIVE);
        }

        Self {
            store: Arc::new(CountingStore::new()),
            discovery: Arc::new(ScriptedDiscovery::new(&shorts)),
            heartbeat: Arc::new(heartbeat),
            directory: Arc::new(MockDirectory::new(dcs)),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.store.clone(),
            self.discovery.clone(),
            self.heartbeat.clone(),
            self.directory.clone(),
        )
        .with_reachability(Arc::new(AlwaysReachable))
    }

    pub async fn context(&self, config: AffinityConfig) -> Arc<AgentContext> {
        Arc::new(
            AgentContext::build(config, self.collaborators())
                .await
                .expect("context builds"),
        )
    }

    pub async fn row(&self, short: &str) -> Option<DcCacheEntry> {
        self.store.get_dc_entry(&dc(short)).await.unwrap()
    }
}

/// Both workers over one context, ticked by hand
pub struct Harness {
    pub ctx: Arc<AgentContext>,
    pub cache: CacheRefreshWorker,
    pub state_machine: AffinityStateMachine,
    /// Shutdown flag seen by the cache worker's probe tasks
    pub cache_handle: WakeHandle,
}

impl Harness {
    pub async fn new(fixture: &Fixture, config: AffinityConfig) -> Self {
        Self::over(fixture.context(config).await)
    }

    /// Workers over an existing context, such as a service's
    pub fn over(ctx: Arc<AgentContext>) -> Self {
        let cache_timer = WakeableTimer::new("cache-refresh");
        let state_timer = WakeableTimer::new("state-machine");
        let cache_handle = cache_timer.handle();
        let state_machine = AffinityStateMachine::new(Arc::clone(&ctx), state_timer);
        let cache = CacheRefreshWorker::new(Arc::clone(&ctx), cache_timer, state_machine.wake_handle());

        Self {
            ctx,
            cache,
            state_machine,
            cache_handle,
        }
    }

    /// One cache tick with its probes settled
    pub async fn refresh(&mut self) {
        let report = self.cache.tick().await.expect("cache tick succeeds");
        report.settle().await;
    }

    pub async fn step(&mut self) -> AffinityState {
        self.state_machine.tick().await.expect("state tick succeeds").to
    }

    /// Tick the state machine until it stops asking for an immediate re-tick
    pub async fn settle_state(&mut self) -> AffinityState {
        for _ in 0..8 {
            let outcome = self.state_machine.tick().await.expect("state tick succeeds");
            if !outcome.retick {
                return outcome.to;
            }
        }
        panic!("state machine kept re-ticking");
    }

    pub async fn affinitized(&self) -> Option<String> {
        self.ctx.affinitized_dc().await.unwrap().map(|dc| dc.dc_name)
    }
}
