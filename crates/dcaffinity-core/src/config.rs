//! Configuration types for the DC affinity agent
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Main agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityConfig {
    /// Joined domain (e.g., "corp.example.com")
    pub domain: String,

    /// DC used before any affinity exists, and when affinity is off
    pub bootstrap_dc: String,

    /// Client site; learned from the first affinitized DC when unset
    #[serde(default)]
    pub site_name: Option<String>,

    /// Machine account used for heartbeat and directory calls
    #[serde(default)]
    pub credentials: MachineCredentials,

    /// HA mode used when the store has none recorded
    #[serde(default = "default_ha_enabled")]
    pub ha_enabled: bool,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub state_store: StateStoreConfig,

    /// Number of state-machine runs kept by the in-memory superlog
    #[serde(default = "default_superlog_capacity")]
    pub superlog_capacity: usize,
}

impl AffinityConfig {
    /// Create a configuration with defaults for everything but the domain and bootstrap DC
    pub fn new(domain: impl Into<String>, bootstrap_dc: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            bootstrap_dc: bootstrap_dc.into(),
            site_name: None,
            credentials: MachineCredentials::default(),
            ha_enabled: default_ha_enabled(),
            timing: TimingConfig::default(),
            probe: ProbeConfig::default(),
            state_store: StateStoreConfig::default(),
            superlog_capacity: default_superlog_capacity(),
        }
    }

    /// Set the client site
    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site_name = Some(site.into());
        self
    }

    /// Set the machine credentials
    pub fn with_credentials(mut self, credentials: MachineCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.domain.trim().is_empty() {
            return Err(crate::Error::config("Domain name cannot be empty"));
        }
        if self.bootstrap_dc.trim().trim_end_matches('.').is_empty() {
            return Err(crate::Error::config("Bootstrap DC cannot be empty"));
        }
        if self.superlog_capacity == 0 {
            return Err(crate::Error::config("Superlog capacity must be > 0"));
        }

        self.timing.validate()?;
        self.probe.validate()?;

        Ok(())
    }
}

/// Machine account credentials
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct MachineCredentials {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub password: String,
}

impl MachineCredentials {
    pub fn new(account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for MachineCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineCredentials")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Worker scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Period of both worker loops (in seconds)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Period of full DNS re-discovery (in seconds)
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Off-site DCs are probed on one tick out of this many
    #[serde(default = "default_offsite_probe_every")]
    pub offsite_probe_every: u32,
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.heartbeat_interval_secs == 0 {
            return Err(crate::Error::config("Heartbeat interval must be > 0"));
        }
        if self.refresh_interval_secs == 0 {
            return Err(crate::Error::config("Refresh interval must be > 0"));
        }
        if self.offsite_probe_every == 0 {
            return Err(crate::Error::config("Off-site probe cadence must be > 0"));
        }
        Ok(())
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            offsite_probe_every: default_offsite_probe_every(),
        }
    }
}

/// Health probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Bound on the TCP precheck and on the heartbeat RPC (in milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,

    /// Port of the DC's heartbeat service
    #[serde(default = "default_heartbeat_port")]
    pub heartbeat_port: u16,

    /// Port checked before issuing a DNS query to a DC
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.timeout_ms == 0 {
            return Err(crate::Error::config("Probe timeout must be > 0"));
        }
        if self.heartbeat_port == 0 || self.dns_port == 0 {
            return Err(crate::Error::config("Probe ports must be non-zero"));
        }
        Ok(())
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            heartbeat_port: default_heartbeat_port(),
            dns_port: default_dns_port(),
        }
    }
}

/// Cache store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateStoreConfig {
    /// File-based cache store
    File {
        /// Path to the cache file
        path: String,
    },

    /// In-memory cache store (not persistent)
    #[default]
    Memory,
}

fn default_ha_enabled() -> bool {
    true
}

fn default_superlog_capacity() -> usize {
    64
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_refresh_interval_secs() -> u64 {
    1800
}

fn default_offsite_probe_every() -> u32 {
    3
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_heartbeat_port() -> u16 {
    2020
}

fn default_dns_port() -> u16 {
    53
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_minimal_json() {
        let config: AffinityConfig = serde_json::from_str(
            r#"{"domain": "corp.example.com", "bootstrap_dc": "dc1.corp.example.com"}"#,
        )
        .unwrap();

        assert!(config.ha_enabled);
        assert_eq!(config.timing.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.timing.refresh_interval(), Duration::from_secs(1800));
        assert_eq!(config.timing.offsite_probe_every, 3);
        assert_eq!(config.probe.heartbeat_port, 2020);
        assert!(matches!(config.state_store, StateStoreConfig::Memory));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_store_config_is_tagged() {
        let config: StateStoreConfig =
            serde_json::from_str(r#"{"type": "file", "path": "/var/lib/dcaffinity/cache.json"}"#)
                .unwrap();
        assert!(matches!(config, StateStoreConfig::File { ref path } if path.ends_with("cache.json")));
    }

    #[test]
    fn missing_bootstrap_dc_is_rejected() {
        let config = AffinityConfig::new("corp.example.com", " . ");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut config = AffinityConfig::new("corp.example.com", "dc1");
        config.timing.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AffinityConfig::new("corp.example.com", "dc1");
        config.timing.offsite_probe_every = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = MachineCredentials::new("HOST$", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("HOST$"));
        assert!(!rendered.contains("hunter2"));
    }
}
