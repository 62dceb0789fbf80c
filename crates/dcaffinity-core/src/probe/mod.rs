//! Single-DC health check
//!
//! A probe answers one question: is this DC alive right now, how fast did
//! it answer, and which site is it in.
//!
//! ## Steps
//!
//! 1. TCP precheck against the heartbeat port. A refused or slow connect
//!    means `HostDown` and the RPC is skipped.
//! 2. Heartbeat RPC, bounded by the probe timeout. The DC's self-reported
//!    flag is the verdict. RTT is measured around this call.
//! 3. Directory round trip for the site name, only when the DC is alive.
//!    Failure here never changes the verdict.
//!
//! Probes have no side effects; callers decide what to persist.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{MachineCredentials, ProbeConfig};
use crate::error::{Error, Result};
use crate::traits::{DirectoryClient, HeartbeatClient, HeartbeatStatus, Reachability};

/// Result of one probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub dc_name: String,
    pub alive: bool,
    pub rtt_ms: u64,
    /// `None` when the directory could not be asked this round
    pub site_name: Option<String>,
    pub last_error: Option<String>,
    /// `None` when the heartbeat RPC failed
    pub heartbeat: Option<HeartbeatStatus>,
    pub probed_at: DateTime<Utc>,
}

/// Directory-only site lookup used by reconciliation
#[async_trait]
pub trait SiteResolver: Send + Sync {
    /// Best effort; `None` if the site could not be learned
    async fn resolve_site(&self, dc_name: &str, domain: &str) -> Option<String>;
}

/// Reachability check over a real TCP connect
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpReachability;

#[async_trait]
impl Reachability for TcpReachability {
    async fn check(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(Error::host_down(format!("{}:{}: {}", host, port, e))),
            Err(_) => Err(Error::host_down(format!(
                "{}:{} did not accept a connection within {:?}",
                host, port, timeout
            ))),
        }
    }
}

/// DC health check
pub struct HealthProbe {
    heartbeat: Arc<dyn HeartbeatClient>,
    directory: Arc<dyn DirectoryClient>,
    reachability: Arc<dyn Reachability>,
    credentials: MachineCredentials,
    heartbeat_port: u16,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(
        heartbeat: Arc<dyn HeartbeatClient>,
        directory: Arc<dyn DirectoryClient>,
        reachability: Arc<dyn Reachability>,
        credentials: MachineCredentials,
        config: &ProbeConfig,
    ) -> Self {
        Self {
            heartbeat,
            directory,
            reachability,
            credentials,
            heartbeat_port: config.heartbeat_port,
            timeout: config.timeout(),
        }
    }

    /// Probe `dc_name`. Never fails; failures are reported in the outcome
    pub async fn probe(&self, dc_name: &str, domain: &str) -> ProbeOutcome {
        let probed_at = Utc::now();
        let (verdict, rtt_ms) = self.check_heartbeat(dc_name).await;

        let (alive, heartbeat, last_error) = match verdict {
            Ok(status) if status.is_alive => (true, Some(status), None),
            Ok(status) => {
                let failed: Vec<&str> = status.failed_services().collect();
                let message = if failed.is_empty() {
                    "DC reported itself not alive".to_string()
                } else {
                    format!("DC reported failed services: {}", failed.join(", "))
                };
                (false, Some(status), Some(message))
            }
            Err(e) => (false, None, Some(e.to_string())),
        };

        let site_name = if alive {
            self.resolve_site(dc_name, domain).await
        } else {
            None
        };

        debug!(dc = dc_name, alive, rtt_ms, site = ?site_name, "Probe finished");

        ProbeOutcome {
            dc_name: dc_name.to_string(),
            alive,
            rtt_ms,
            site_name,
            last_error,
            heartbeat,
            probed_at,
        }
    }

    async fn check_heartbeat(&self, dc_name: &str) -> (Result<HeartbeatStatus>, u64) {
        if let Err(e) = self
            .reachability
            .check(dc_name, self.heartbeat_port, self.timeout)
            .await
        {
            return (Err(e), 0);
        }

        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(
            self.timeout,
            self.heartbeat.heartbeat(dc_name, &self.credentials),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "heartbeat to {} exceeded {:?}",
                dc_name, self.timeout
            ))),
        };
        let rtt_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        (result, rtt_ms)
    }
}

#[async_trait]
impl SiteResolver for HealthProbe {
    async fn resolve_site(&self, dc_name: &str, domain: &str) -> Option<String> {
        let lookup = self.directory.site_name(dc_name, domain, &self.credentials);
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(site)) if !site.trim().is_empty() => Some(site.trim().to_string()),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                debug!(dc = dc_name, error = %e, "Site lookup failed");
                None
            }
            Err(_) => {
                debug!(dc = dc_name, "Site lookup timed out");
                None
            }
        }
    }
}
