// # dcaffinity-core
//
// Core library for the domain controller affinity agent.
//
// ## Architecture Overview
//
// The agent keeps a domain-joined client pointed at a healthy, nearby DC:
// - **DcDiscovery**: Trait for listing the DCs of a domain (DNS SRV)
// - **HeartbeatClient**: Trait for the per-DC liveness RPC
// - **DirectoryClient**: Trait for site lookups and the functional level query
// - **CacheStore**: Trait for the persisted DC cache, state and HA mode
// - **CacheRefreshWorker**: Discovers DCs and probes them on a timer
// - **AffinityStateMachine**: Picks the affinitized DC and drives the state
// - **AffinityService**: Owns both workers and the administrative surface
//
// ## Design Principles
//
// 1. **Two loops, one store**: The workers share only the store and a wake handle
// 2. **Serialized transitions**: Every state change goes through one lock and one table
// 3. **Isolated probes**: One slow or failing DC never delays the others
// 4. **Library-First**: The daemon is a thin shell over this crate
// 5. **Deterministic shutdown**: Both loops exit and the store is flushed

pub mod traits;
pub mod config;
pub mod error;
pub mod state;
pub mod superlog;
pub mod timer;
pub mod probe;
pub mod cache;
pub mod worker;
pub mod service;

// Re-export core types for convenience
pub use traits::{
    AffinitizedDc, AffinityState, CacheStore, DcCacheEntry, DcDiscovery, DirectoryClient, HaMode,
    HeartbeatClient, HeartbeatStatus, Reachability, Superlog, SuperlogEntry,
};
pub use config::{AffinityConfig, MachineCredentials, ProbeConfig, StateStoreConfig, TimingConfig};
pub use error::{Error, Result};
pub use state::{FileCacheStore, MemoryCacheStore};
pub use superlog::MemorySuperlog;
pub use probe::{HealthProbe, TcpReachability};
pub use cache::DcCache;
pub use worker::{AffinityStateMachine, AgentContext, CacheRefreshWorker, Collaborators};
pub use service::{AffinityService, DcStatus};
