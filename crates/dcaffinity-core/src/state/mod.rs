// # Cache Store Implementations
//
// This module provides implementations of the CacheStore trait for
// different persistence strategies. Both share `CacheSnapshot`, which
// holds the rows and enforces the keying rules.

pub mod file;
pub mod memory;

pub use file::FileCacheStore;
pub use memory::MemoryCacheStore;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::Error;
use crate::traits::{AffinitizedDc, AffinityState, DcCacheEntry, EntryStatus, HaMode, HeartbeatStatus};

/// Row key: DC and domain names compare case-insensitively
pub(crate) fn row_key(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Reconciliation tags are never persisted
fn stored(entry: &DcCacheEntry) -> DcCacheEntry {
    let mut row = entry.clone();
    row.entry_status = EntryStatus::Existing;
    row
}

/// Everything a cache store persists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CacheSnapshot {
    #[serde(default)]
    pub ha_mode: Option<HaMode>,
    #[serde(default)]
    pub state: Option<AffinityState>,
    #[serde(default)]
    pub client_site: Option<String>,
    /// Keyed by domain
    #[serde(default)]
    pub affinitized: HashMap<String, AffinitizedDc>,
    /// Keyed by DC name
    #[serde(default)]
    pub dcs: BTreeMap<String, DcCacheEntry>,
    /// Keyed by DC name
    #[serde(default)]
    pub heartbeats: HashMap<String, HeartbeatStatus>,
}

impl CacheSnapshot {
    pub fn list_dc_entries(&self, domain: &str) -> Vec<DcCacheEntry> {
        self.dcs
            .values()
            .filter(|e| e.domain_name.eq_ignore_ascii_case(domain))
            .cloned()
            .collect()
    }

    pub fn insert_dc_entry(&mut self, entry: &DcCacheEntry) -> Result<(), Error> {
        let key = row_key(&entry.dc_name);
        if key.is_empty() {
            return Err(Error::invalid_input("DC name cannot be empty"));
        }
        if self.dcs.contains_key(&key) {
            return Err(Error::state_store(format!(
                "DC cache row already exists: {}",
                entry.dc_name
            )));
        }
        self.dcs.insert(key, stored(entry));
        Ok(())
    }

    pub fn update_dc_entry(&mut self, entry: &DcCacheEntry) -> Result<(), Error> {
        match self.dcs.get_mut(&row_key(&entry.dc_name)) {
            Some(row) => {
                *row = stored(entry);
                Ok(())
            }
            None => Err(Error::not_found(format!("DC cache row {}", entry.dc_name))),
        }
    }

    pub fn delete_dc_entry(&mut self, dc_name: &str) {
        let key = row_key(dc_name);
        self.dcs.remove(&key);
        self.heartbeats.remove(&key);
    }

    pub fn purge_dc_entries(&mut self) {
        self.dcs.clear();
        self.heartbeats.clear();
    }
}
