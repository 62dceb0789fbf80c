// # Cache Store Trait
//
// Defines the narrow CRUD interface over the agent's persisted state.
//
// ## Purpose
//
// The cache store holds everything that must survive a restart:
// - HA mode, affinity state and client site (one row)
// - The affinitized DC (one row per domain)
// - The DC cache table (one row per DC name)
// - Per-DC heartbeat detail from the last successful probe
//
// The workers and the administrative surface communicate only through
// this store and a wake signal.
//
// ## Implementations
//
// - `MemoryCacheStore`: in-process, lost on restart
// - `FileCacheStore`: JSON file with atomic writes and backup recovery
//
// ## Usage
//
// ```rust
// use dcaffinity_core::traits::{AffinityState, CacheStore};
//
// async fn example(store: &dyn CacheStore) -> dcaffinity_core::Result<()> {
//     let state = store.get_state().await?.unwrap_or(AffinityState::Legacy);
//     for entry in store.list_dc_entries("corp.example.com").await? {
//         println!("{} alive={}", entry.dc_name, entry.is_alive);
//     }
//     Ok(())
// }
// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::traits::heartbeat::HeartbeatStatus;

/// Persisted affinity state
///
/// `Legacy` and `Disabled` mean the agent is inactive; the other four are
/// the armed states the state machine moves between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityState {
    Legacy,
    Disabled,
    NoDcList,
    SiteAffinitized,
    OffSite,
    NoDcsAlive,
}

impl AffinityState {
    /// All states, in declaration order
    pub const ALL: [AffinityState; 6] = [
        AffinityState::Legacy,
        AffinityState::Disabled,
        AffinityState::NoDcList,
        AffinityState::SiteAffinitized,
        AffinityState::OffSite,
        AffinityState::NoDcsAlive,
    ];

    /// Whether the state machine is tracking a DC in this state
    pub fn is_armed(self) -> bool {
        !matches!(self, AffinityState::Legacy | AffinityState::Disabled)
    }
}

impl fmt::Display for AffinityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AffinityState::Legacy => "Legacy",
            AffinityState::Disabled => "Disabled",
            AffinityState::NoDcList => "NoDcList",
            AffinityState::SiteAffinitized => "SiteAffinitized",
            AffinityState::OffSite => "OffSite",
            AffinityState::NoDcsAlive => "NoDcsAlive",
        };
        f.write_str(name)
    }
}

/// HA mode: whether DC affinity is switched on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaMode {
    /// Affinity enabled
    Default,
    /// Affinity disabled, clients use the bootstrap DC
    Legacy,
}

/// The DC this client is currently pinned to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinitizedDc {
    pub dc_name: String,
    pub domain_name: String,
    pub site_name: String,
    /// `None` for the synthesized answer returned while affinity is off
    pub affinitized_since: Option<DateTime<Utc>>,
}

/// Transient reconciliation tag; tells the write step which operation to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryStatus {
    /// Discovered, not yet in the store
    New,
    /// Probe data changed
    Update,
    /// Cached row had no site; a site was learned
    SiteUpdate,
    /// Nothing to write
    #[default]
    Existing,
    /// Removed from the store during reconciliation
    Deleted,
}

/// One row of the DC cache table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcCacheEntry {
    pub dc_name: String,
    pub domain_name: String,
    /// Empty when unknown
    #[serde(default)]
    pub site_name: String,
    #[serde(default)]
    pub last_ping_time_ms: u64,
    #[serde(default)]
    pub last_ping_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_alive: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(skip)]
    pub entry_status: EntryStatus,
}

impl DcCacheEntry {
    /// A never-probed row
    pub fn new(dc_name: impl Into<String>, domain_name: impl Into<String>) -> Self {
        Self {
            dc_name: dc_name.into(),
            domain_name: domain_name.into(),
            site_name: String::new(),
            last_ping_time_ms: 0,
            last_ping_at: None,
            is_alive: false,
            last_error: None,
            entry_status: EntryStatus::New,
        }
    }

    pub fn with_site(mut self, site_name: impl Into<String>) -> Self {
        self.site_name = site_name.into();
        self
    }

    pub fn has_site(&self) -> bool {
        !self.site_name.is_empty()
    }

    /// Case-insensitive site match; an unknown site never matches
    pub fn is_in_site(&self, site: &str) -> bool {
        self.has_site() && self.site_name.eq_ignore_ascii_case(site)
    }
}

/// Trait for cache store implementations
///
/// Implementations own their locking; every method must be safe to call
/// concurrently from the two workers, the probe tasks and administrative
/// callers.
///
/// DC names are matched case-insensitively. Domains are matched
/// case-insensitively.
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - ✅ Perform I/O for persistent storage
/// - ✅ Keep an in-memory copy with explicit flush
///
/// ## Forbidden Capabilities
/// - ❌ Decide transitions (owned by `AffinityStateMachine`)
/// - ❌ Probe DCs or perform discovery
/// - ❌ Spawn background tasks
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// HA mode, `None` if never written
    async fn get_ha_mode(&self) -> Result<Option<HaMode>, crate::Error>;

    async fn set_ha_mode(&self, mode: HaMode) -> Result<(), crate::Error>;

    /// Affinity state, `None` if never written
    async fn get_state(&self) -> Result<Option<AffinityState>, crate::Error>;

    async fn set_state(&self, state: AffinityState) -> Result<(), crate::Error>;

    /// Client site, `None` if never learned or configured
    async fn get_client_site(&self) -> Result<Option<String>, crate::Error>;

    async fn set_client_site(&self, site: &str) -> Result<(), crate::Error>;

    async fn get_affinitized_dc(&self, domain: &str)
    -> Result<Option<AffinitizedDc>, crate::Error>;

    /// Overwrites the row for `dc.domain_name`
    async fn set_affinitized_dc(&self, dc: &AffinitizedDc) -> Result<(), crate::Error>;

    /// Removing a missing row is not an error
    async fn delete_affinitized_dc(&self, domain: &str) -> Result<(), crate::Error>;

    /// All cached rows for a domain, ordered by DC name
    async fn list_dc_entries(&self, domain: &str) -> Result<Vec<DcCacheEntry>, crate::Error>;

    async fn get_dc_entry(&self, dc_name: &str) -> Result<Option<DcCacheEntry>, crate::Error>;

    /// Fails if a row with the same name exists
    async fn insert_dc_entry(&self, entry: &DcCacheEntry) -> Result<(), crate::Error>;

    /// Fails with `NotFound` if the row does not exist
    async fn update_dc_entry(&self, entry: &DcCacheEntry) -> Result<(), crate::Error>;

    /// Also removes the row's heartbeat detail. Removing a missing row is not an error
    async fn delete_dc_entry(&self, dc_name: &str) -> Result<(), crate::Error>;

    /// Removes every DC row and all heartbeat detail
    async fn purge_dc_entries(&self) -> Result<(), crate::Error>;

    async fn get_heartbeat_status(
        &self,
        dc_name: &str,
    ) -> Result<Option<HeartbeatStatus>, crate::Error>;

    async fn set_heartbeat_status(
        &self,
        dc_name: &str,
        status: &HeartbeatStatus,
    ) -> Result<(), crate::Error>;

    async fn delete_heartbeat_status(&self, dc_name: &str) -> Result<(), crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}
