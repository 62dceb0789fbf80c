// # Reachability Trait
//
// Cheap TCP precheck run before the heavier heartbeat RPC or DNS query.

use async_trait::async_trait;
use std::time::Duration;

/// Trait for port reachability checks
#[async_trait]
pub trait Reachability: Send + Sync {
    /// `Ok(())` if `host:port` accepts a connection within `timeout`
    ///
    /// # Errors
    ///
    /// - `HostDown` when the connection is refused or times out
    async fn check(&self, host: &str, port: u16, timeout: Duration) -> Result<(), crate::Error>;
}
