//! Error types for the DC affinity agent
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

use crate::traits::AffinityState;

/// Result type alias for affinity operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the DC affinity agent
#[derive(Error, Debug)]
pub enum Error {
    /// DNS SRV discovery failed
    #[error("DC discovery error: {0}")]
    Discovery(String),

    /// Heartbeat RPC failed or returned garbage
    #[error("Heartbeat error: {0}")]
    Heartbeat(String),

    /// Directory connection or query failed
    #[error("Directory error: {0}")]
    Directory(String),

    /// TCP precheck failed, the host is not accepting connections
    #[error("Host down: {0}")]
    HostDown(String),

    /// A collaborator did not answer in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Cache store errors
    #[error("Cache store error: {0}")]
    StateStore(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Requested state change is not in the transition table
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Persisted state at the time of the request
        from: AffinityState,
        /// Requested state
        to: AffinityState,
    },

    /// Operation requires affinity to be enabled
    #[error("DC affinity is disabled")]
    HaDisabled,

    /// Domain argument does not match the joined domain
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// Row or candidate not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The agent is shutting down; waiters are released with this error
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a discovery error
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a heartbeat error
    pub fn heartbeat(msg: impl Into<String>) -> Self {
        Self::Heartbeat(msg.into())
    }

    /// Create a directory error
    pub fn directory(msg: impl Into<String>) -> Self {
        Self::Directory(msg.into())
    }

    /// Create a host-down error
    pub fn host_down(msg: impl Into<String>) -> Self {
        Self::HostDown(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a cache store error
    pub fn state_store(msg: impl Into<String>) -> Self {
        Self::StateStore(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid transition error
    pub fn invalid_transition(from: AffinityState, to: AffinityState) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// Create an invalid domain error
    pub fn invalid_domain(msg: impl Into<String>) -> Self {
        Self::InvalidDomain(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Transient errors are recorded against a DC and retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Discovery(_)
                | Self::Heartbeat(_)
                | Self::Directory(_)
                | Self::HostDown(_)
                | Self::Timeout(_)
                | Self::Io(_)
        )
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_both_states() {
        let err = Error::invalid_transition(AffinityState::Legacy, AffinityState::OffSite);
        assert_eq!(err.to_string(), "Invalid state transition: Legacy -> OffSite");
    }

    #[test]
    fn probe_failures_are_transient() {
        assert!(Error::host_down("dc1").is_transient());
        assert!(Error::timeout("heartbeat").is_transient());
        assert!(!Error::HaDisabled.is_transient());
        assert!(!Error::invalid_transition(AffinityState::Legacy, AffinityState::NoDcsAlive).is_transient());
    }
}
