//! Collaborator traits for the DC affinity agent
//!
//! This module defines the interfaces the agent orchestrates but does not implement.
//!
//! - [`DcDiscovery`]: DNS SRV discovery of a domain's DCs
//! - [`HeartbeatClient`]: remote heartbeat RPC to a DC
//! - [`DirectoryClient`]: site and functional-level lookups
//! - [`Reachability`]: TCP precheck
//! - [`CacheStore`]: persisted state
//! - [`Superlog`]: diagnostic log of state-machine runs

pub mod cache_store;
pub mod directory;
pub mod discovery;
pub mod heartbeat;
pub mod reachability;
pub mod superlog;

pub use cache_store::{AffinitizedDc, AffinityState, CacheStore, DcCacheEntry, EntryStatus, HaMode};
pub use directory::DirectoryClient;
pub use discovery::{DcDiscovery, ldap_srv_name};
pub use heartbeat::{HeartbeatClient, HeartbeatStatus, ServiceHeartbeat};
pub use reachability::Reachability;
pub use superlog::{Superlog, SuperlogEntry};
