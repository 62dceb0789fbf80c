// # Superlog Trait
//
// Structured diagnostic log with one entry per state-machine run.
// Purely observational: nothing reads it back to make decisions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::traits::cache_store::AffinityState;

/// One state-machine run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperlogEntry {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub domain_name: String,
    /// Affinitized DC after the run
    pub dc_name: Option<String>,
    pub site_name: Option<String>,
    pub state: AffinityState,
    pub error: Option<String>,
}

/// Trait for diagnostic log sinks
#[async_trait]
pub trait Superlog: Send + Sync {
    async fn record(&self, entry: SuperlogEntry);

    /// Most recent entries, newest first
    async fn recent(&self, limit: usize) -> Vec<SuperlogEntry>;
}
