//! DC cache: reconciliation and queries over the persisted DC table
//!
//! ## Reconciliation
//!
//! ```text
//!   discovered (DNS)        cached (store)
//!         │                      │
//!         └──────── match ───────┘
//!                    │
//!   in both ─────────┼──▶ Existing, or SiteUpdate when a missing site is learned
//!   only discovered ─┼──▶ New (site resolved best effort)
//!   only cached ─────┴──▶ Deleted; the row is removed unless it is the affinitized DC
//! ```
//!
//! `persist` then applies the tags. Per-row failures are logged and
//! counted, never abort the batch.
//!
//! ## Selection
//!
//! Among alive rows the lowest `last_ping_time_ms` wins, ties broken by
//! name so the answer is deterministic.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::probe::{ProbeOutcome, SiteResolver};
use crate::state::row_key;
use crate::traits::{CacheStore, DcCacheEntry, EntryStatus};

/// Trim whitespace and the trailing root dot of an SRV target
pub fn normalize_dc_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_string()
}

/// Row subsets the cache worker probes on different cadences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFilter {
    All,
    /// On the client site, site unknown, or the affinitized DC
    OnSiteAndActive,
    /// Everything not in `OnSiteAndActive`
    OffSite,
}

/// Counters from one `persist` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Reconciliation and selection over a `CacheStore`
#[derive(Clone)]
pub struct DcCache {
    store: Arc<dyn CacheStore>,
    domain: String,
}

impl DcCache {
    pub fn new(store: Arc<dyn CacheStore>, domain: impl Into<String>) -> Self {
        Self {
            store,
            domain: domain.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Name of the affinitized DC, if any
    async fn affinitized_name(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get_affinitized_dc(&self.domain)
            .await?
            .map(|dc| dc.dc_name))
    }

    /// Tag every cached and discovered DC; deletes stale rows
    pub async fn reconcile_with_discovered(
        &self,
        discovered: &[String],
        resolver: &dyn SiteResolver,
    ) -> Result<Vec<DcCacheEntry>> {
        let affinitized = self.affinitized_name().await?.map(|name| row_key(&name));

        let mut wanted: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for name in discovered {
            let name = normalize_dc_name(name);
            if !name.is_empty() && seen.insert(row_key(&name)) {
                wanted.push(name);
            }
        }

        let cached = self.store.list_dc_entries(&self.domain).await?;
        let mut tagged = Vec::with_capacity(cached.len() + wanted.len());
        let mut known = HashSet::new();

        for mut entry in cached {
            let key = row_key(&entry.dc_name);
            known.insert(key.clone());

            if seen.contains(&key) {
                entry.entry_status = EntryStatus::Existing;
                if !entry.has_site() {
                    if let Some(site) = resolver.resolve_site(&entry.dc_name, &self.domain).await {
                        entry.site_name = site;
                        entry.entry_status = EntryStatus::SiteUpdate;
                    }
                }
            } else if affinitized.as_deref() == Some(key.as_str()) {
                debug!(dc = %entry.dc_name, "Affinitized DC missing from DNS, keeping its row");
                entry.entry_status = EntryStatus::Deleted;
            } else {
                match self.store.delete_dc_entry(&entry.dc_name).await {
                    Ok(()) => info!(dc = %entry.dc_name, "Removed DC no longer in DNS"),
                    Err(e) => warn!(dc = %entry.dc_name, error = %e, "Failed to remove stale DC row"),
                }
                entry.entry_status = EntryStatus::Deleted;
            }
            tagged.push(entry);
        }

        for name in wanted {
            if known.contains(&row_key(&name)) {
                continue;
            }
            let mut entry = DcCacheEntry::new(name, self.domain.clone());
            if let Some(site) = resolver.resolve_site(&entry.dc_name, &self.domain).await {
                entry.site_name = site;
            }
            tagged.push(entry);
        }

        Ok(tagged)
    }

    /// Apply reconciliation tags to the store
    pub async fn persist(&self, entries: &[DcCacheEntry]) -> PersistReport {
        let mut report = PersistReport::default();

        for entry in entries {
            let result = match entry.entry_status {
                EntryStatus::New => self.store.insert_dc_entry(entry).await.map(|_| report.inserted += 1),
                EntryStatus::Update | EntryStatus::SiteUpdate => {
                    self.store.update_dc_entry(entry).await.map(|_| report.updated += 1)
                }
                EntryStatus::Existing | EntryStatus::Deleted => Ok(()),
            };

            if let Err(e) = result {
                report.failed += 1;
                warn!(dc = %entry.dc_name, status = ?entry.entry_status, error = %e, "Failed to persist DC row");
            }
        }

        report
    }

    /// Alive DC on `site` with the lowest ping time
    pub async fn closest_on_site(&self, site: &str) -> Result<DcCacheEntry> {
        self.closest(|entry| entry.is_in_site(site))
            .await?
            .ok_or_else(|| Error::not_found(format!("no alive DC in site {}", site)))
    }

    /// Alive DC in any site with the lowest ping time
    pub async fn closest_any(&self) -> Result<DcCacheEntry> {
        self.closest(|_| true)
            .await?
            .ok_or_else(|| Error::not_found(format!("no alive DC in domain {}", self.domain)))
    }

    async fn closest<F>(&self, filter: F) -> Result<Option<DcCacheEntry>>
    where
        F: Fn(&DcCacheEntry) -> bool,
    {
        let rows = self.store.list_dc_entries(&self.domain).await?;
        Ok(rows
            .into_iter()
            .filter(|e| e.is_alive && filter(e))
            .min_by(|a, b| {
                a.last_ping_time_ms
                    .cmp(&b.last_ping_time_ms)
                    .then_with(|| row_key(&a.dc_name).cmp(&row_key(&b.dc_name)))
            }))
    }

    /// `false` for unknown DCs
    pub async fn is_alive(&self, dc_name: &str) -> Result<bool> {
        Ok(self
            .store
            .get_dc_entry(dc_name)
            .await?
            .is_some_and(|e| e.is_alive))
    }

    pub async fn entry(&self, dc_name: &str) -> Result<Option<DcCacheEntry>> {
        self.store.get_dc_entry(dc_name).await
    }

    /// Insert or overwrite a row
    pub async fn upsert(&self, entry: &DcCacheEntry) -> Result<()> {
        match self.store.update_dc_entry(entry).await {
            Err(Error::NotFound(_)) => self.store.insert_dc_entry(entry).await,
            other => other,
        }
    }

    pub async fn delete(&self, dc_name: &str) -> Result<()> {
        self.store.delete_dc_entry(dc_name).await
    }

    pub async fn mark_dead(&self, dc_name: &str, error: impl Into<String>) -> Result<()> {
        let Some(mut entry) = self.store.get_dc_entry(dc_name).await? else {
            return Err(Error::not_found(format!("DC cache row {}", dc_name)));
        };
        entry.is_alive = false;
        entry.last_error = Some(error.into());
        entry.last_ping_at = Some(Utc::now());
        self.store.update_dc_entry(&entry).await
    }

    pub async fn purge(&self) -> Result<()> {
        self.store.purge_dc_entries().await
    }

    /// Write a probe result to an existing row and its heartbeat detail
    ///
    /// Fails with `NotFound` when the row was removed while the probe ran.
    pub async fn record_probe(&self, outcome: &ProbeOutcome) -> Result<DcCacheEntry> {
        self.apply_probe(outcome, false).await
    }

    /// Like `record_probe`, but creates the row if the DC was never cached
    pub async fn adopt_probe(&self, outcome: &ProbeOutcome) -> Result<DcCacheEntry> {
        self.apply_probe(outcome, true).await
    }

    async fn apply_probe(&self, outcome: &ProbeOutcome, create: bool) -> Result<DcCacheEntry> {
        let mut entry = match self.store.get_dc_entry(&outcome.dc_name).await? {
            Some(entry) => entry,
            None if create => DcCacheEntry::new(outcome.dc_name.clone(), self.domain.clone()),
            None => return Err(Error::not_found(format!("DC cache row {}", outcome.dc_name))),
        };

        entry.is_alive = outcome.alive;
        entry.last_ping_time_ms = outcome.rtt_ms;
        entry.last_ping_at = Some(outcome.probed_at);
        entry.last_error = outcome.last_error.clone();
        // A known site is not overwritten by a missing one
        if let Some(site) = &outcome.site_name {
            entry.site_name = site.clone();
        }
        entry.entry_status = EntryStatus::Update;

        self.upsert(&entry).await?;

        match &outcome.heartbeat {
            Some(status) if outcome.alive => self.store.set_heartbeat_status(&entry.dc_name, status).await?,
            _ => self.store.delete_heartbeat_status(&entry.dc_name).await?,
        }

        Ok(entry)
    }

    /// Rows matching `filter`; `client_site` decides on-site membership
    pub async fn enumerate(&self, filter: EntryFilter, client_site: Option<&str>) -> Result<Vec<DcCacheEntry>> {
        let rows = self.store.list_dc_entries(&self.domain).await?;
        if filter == EntryFilter::All {
            return Ok(rows);
        }

        let affinitized = self.affinitized_name().await?.map(|name| row_key(&name));
        let on_site_or_active = |entry: &DcCacheEntry| {
            !entry.has_site()
                || client_site.is_some_and(|site| entry.is_in_site(site))
                || affinitized.as_deref() == Some(row_key(&entry.dc_name).as_str())
        };

        Ok(rows
            .into_iter()
            .filter(|e| match filter {
                EntryFilter::OnSiteAndActive => on_site_or_active(e),
                EntryFilter::OffSite => !on_site_or_active(e),
                EntryFilter::All => true,
            })
            .collect())
    }
}
