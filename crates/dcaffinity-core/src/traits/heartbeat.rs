// # Heartbeat Trait
//
// Remote heartbeat RPC: asks a DC whether its own local services are alive.
//
// The agent never decides a DC is healthy on its own; a DC is alive only
// when this call succeeds and the DC reports itself alive. The TCP
// precheck and the timeout are applied by `HealthProbe`, not here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::MachineCredentials;

/// Liveness of one service on the remote DC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHeartbeat {
    pub service_name: String,
    pub is_alive: bool,
    /// Seconds since the service last reported in, as seen by the DC
    pub last_heartbeat_secs: u64,
}

/// Heartbeat RPC answer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    /// The DC's own verdict
    pub is_alive: bool,
    #[serde(default)]
    pub services: Vec<ServiceHeartbeat>,
}

impl HeartbeatStatus {
    pub fn alive() -> Self {
        Self {
            is_alive: true,
            services: Vec::new(),
        }
    }

    pub fn dead() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: ServiceHeartbeat) -> Self {
        self.services.push(service);
        self
    }

    /// Names of the services that reported dead
    pub fn failed_services(&self) -> impl Iterator<Item = &str> {
        self.services
            .iter()
            .filter(|s| !s.is_alive)
            .map(|s| s.service_name.as_str())
    }
}

/// Trait for heartbeat RPC clients
///
/// # Trust Level: Untrusted (Network Collaborator)
///
/// ## Allowed Capabilities
/// - ✅ Open a connection to the named DC and issue one RPC
///
/// ## Forbidden Capabilities
/// - ❌ Retry internally (the cache worker retries on its next tick)
/// - ❌ Write to the cache store
#[async_trait]
pub trait HeartbeatClient: Send + Sync {
    /// Query heartbeat status on `dc_name`
    ///
    /// # Returns
    ///
    /// - `Ok(status)`: the DC answered; `status.is_alive` is its verdict
    /// - `Err(Error)`: transport or RPC failure
    async fn heartbeat(
        &self,
        dc_name: &str,
        credentials: &MachineCredentials,
    ) -> Result<HeartbeatStatus, crate::Error>;
}
