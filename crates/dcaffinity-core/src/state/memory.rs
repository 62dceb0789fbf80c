// # Memory Cache Store
//
// In-memory implementation of CacheStore.
//
// ## Purpose
//
// Fast store that doesn't persist across restarts. Used by tests and by
// deployments where re-running discovery on every start is acceptable.
//
// ## Crash Behavior
//
// - All state is lost on restart/crash
// - After a restart the agent reads as `Legacy` with no HA mode recorded,
//   and the configured HA default applies

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::state::{CacheSnapshot, row_key};
use crate::traits::{
    AffinitizedDc, AffinityState, CacheStore, DcCacheEntry, HaMode, HeartbeatStatus,
};

/// In-memory cache store implementation
///
/// # Example
///
/// ```rust,no_run
/// use dcaffinity_core::state::MemoryCacheStore;
/// use dcaffinity_core::traits::{AffinityState, CacheStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryCacheStore::new();
///     store.set_state(AffinityState::NoDcList).await?;
///     assert_eq!(store.get_state().await?, Some(AffinityState::NoDcList));
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    inner: Arc<RwLock<CacheSnapshot>>,
}

impl MemoryCacheStore {
    /// Create a new empty memory cache store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached DC rows, across domains
    pub async fn dc_count(&self) -> usize {
        self.inner.read().await.dcs.len()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get_ha_mode(&self) -> Result<Option<HaMode>, Error> {
        Ok(self.inner.read().await.ha_mode)
    }

    async fn set_ha_mode(&self, mode: HaMode) -> Result<(), Error> {
        self.inner.write().await.ha_mode = Some(mode);
        Ok(())
    }

    async fn get_state(&self) -> Result<Option<AffinityState>, Error> {
        Ok(self.inner.read().await.state)
    }

    async fn set_state(&self, state: AffinityState) -> Result<(), Error> {
        self.inner.write().await.state = Some(state);
        Ok(())
    }

    async fn get_client_site(&self) -> Result<Option<String>, Error> {
        Ok(self.inner.read().await.client_site.clone())
    }

    async fn set_client_site(&self, site: &str) -> Result<(), Error> {
        self.inner.write().await.client_site = Some(site.to_string());
        Ok(())
    }

    async fn get_affinitized_dc(&self, domain: &str) -> Result<Option<AffinitizedDc>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.affinitized.get(&row_key(domain)).cloned())
    }

    async fn set_affinitized_dc(&self, dc: &AffinitizedDc) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard
            .affinitized
            .insert(row_key(&dc.domain_name), dc.clone());
        Ok(())
    }

    async fn delete_affinitized_dc(&self, domain: &str) -> Result<(), Error> {
        self.inner.write().await.affinitized.remove(&row_key(domain));
        Ok(())
    }

    async fn list_dc_entries(&self, domain: &str) -> Result<Vec<DcCacheEntry>, Error> {
        Ok(self.inner.read().await.list_dc_entries(domain))
    }

    async fn get_dc_entry(&self, dc_name: &str) -> Result<Option<DcCacheEntry>, Error> {
        Ok(self.inner.read().await.dcs.get(&row_key(dc_name)).cloned())
    }

    async fn insert_dc_entry(&self, entry: &DcCacheEntry) -> Result<(), Error> {
        self.inner.write().await.insert_dc_entry(entry)
    }

    async fn update_dc_entry(&self, entry: &DcCacheEntry) -> Result<(), Error> {
        self.inner.write().await.update_dc_entry(entry)
    }

    async fn delete_dc_entry(&self, dc_name: &str) -> Result<(), Error> {
        self.inner.write().await.delete_dc_entry(dc_name);
        Ok(())
    }

    async fn purge_dc_entries(&self) -> Result<(), Error> {
        self.inner.write().await.purge_dc_entries();
        Ok(())
    }

    async fn get_heartbeat_status(&self, dc_name: &str) -> Result<Option<HeartbeatStatus>, Error> {
        Ok(self.inner.read().await.heartbeats.get(&row_key(dc_name)).cloned())
    }

    async fn set_heartbeat_status(&self, dc_name: &str, status: &HeartbeatStatus) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .heartbeats
            .insert(row_key(dc_name), status.clone());
        Ok(())
    }

    async fn delete_heartbeat_status(&self, dc_name: &str) -> Result<(), Error> {
        self.inner.write().await.heartbeats.remove(&row_key(dc_name));
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        // Nothing buffered
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::EntryStatus;

    #[tokio::test]
    async fn test_memory_store_dc_rows() {
        let store = MemoryCacheStore::new();

        let entry = DcCacheEntry::new("DC1.corp.example.com.", "corp.example.com").with_site("Paris");
        store.insert_dc_entry(&entry).await.unwrap();
        assert_eq!(store.dc_count().await, 1);

        // Lookup ignores case and the trailing dot
        let row = store.get_dc_entry("dc1.CORP.example.com").await.unwrap().unwrap();
        assert_eq!(row.site_name, "Paris");
        assert_eq!(row.entry_status, EntryStatus::Existing);

        // Duplicate insert is rejected
        assert!(store.insert_dc_entry(&entry).await.is_err());

        store.delete_dc_entry("dc1.corp.example.com").await.unwrap();
        assert_eq!(store.dc_count().await, 0);
    }

    #[tokio::test]
    async fn test_memory_store_update_missing_row() {
        let store = MemoryCacheStore::new();
        let entry = DcCacheEntry::new("dc9", "corp.example.com");
        let err = store.update_dc_entry(&entry).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_memory_store_list_filters_domain() {
        let store = MemoryCacheStore::new();
        store
            .insert_dc_entry(&DcCacheEntry::new("b.corp", "corp.example.com"))
            .await
            .unwrap();
        store
            .insert_dc_entry(&DcCacheEntry::new("a.corp", "CORP.example.com"))
            .await
            .unwrap();
        store
            .insert_dc_entry(&DcCacheEntry::new("x.other", "other.example.com"))
            .await
            .unwrap();

        let rows = store.list_dc_entries("corp.example.com").await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.dc_name.as_str()).collect();
        assert_eq!(names, vec!["a.corp", "b.corp"]);
    }

    #[tokio::test]
    async fn test_memory_store_purge_drops_heartbeats() {
        let store = MemoryCacheStore::new();
        store
            .insert_dc_entry(&DcCacheEntry::new("dc1", "corp.example.com"))
            .await
            .unwrap();
        store
            .set_heartbeat_status("dc1", &HeartbeatStatus::alive())
            .await
            .unwrap();

        store.purge_dc_entries().await.unwrap();

        assert_eq!(store.dc_count().await, 0);
        assert!(store.get_heartbeat_status("dc1").await.unwrap().is_none());
    }
}
