// # dcaffinityd - DC Affinity Daemon
//
// This daemon is a THIN integration layer:
// - DO NOT add selection, probing, or state logic here
// - All affinity logic lives in dcaffinity-core
// - Configuration is via environment variables only
//
// The dcaffinityd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Building the cache store and the network collaborators
// 4. Running the affinity service until SIGTERM/SIGINT
//
// ## Configuration
//
// ### Domain
// - `DCAFFINITY_DOMAIN`: Joined domain (required)
// - `DCAFFINITY_BOOTSTRAP_DC`: DC used before any affinity exists (required)
// - `DCAFFINITY_SITE_NAME`: Client site (optional; learned from the bootstrap DC)
// - `DCAFFINITY_ACCOUNT` / `DCAFFINITY_PASSWORD`: Machine credentials
// - `DCAFFINITY_HA_ENABLED`: Affinity on when nothing is persisted (default true)
//
// ### Discovery and directory
// - `DCAFFINITY_DISCOVERY_TYPE`: `dns` (SRV via the DC) or `static`
// - `DCAFFINITY_DC_LIST`: Comma-separated DCs (for static discovery)
// - `DCAFFINITY_DC_SITES`: Comma-separated `dc=site` pairs
// - `DCAFFINITY_SUPPORTS_AFFINITY`: Domain functional level answer (default true)
//
// ### Timing and probes
// - `DCAFFINITY_HEARTBEAT_INTERVAL_SECS`: Worker period (default 60)
// - `DCAFFINITY_REFRESH_INTERVAL_SECS`: Full rediscovery period (default 1800)
// - `DCAFFINITY_PROBE_TIMEOUT_MS`: Probe timeout (default 5000)
// - `DCAFFINITY_HEARTBEAT_PORT`: DC heartbeat port (default 2020)
// - `DCAFFINITY_DNS_PORT`: DC DNS port (default 53)
//
// ### State Store
// - `DCAFFINITY_STATE_STORE_TYPE`: Type of store (file, memory)
// - `DCAFFINITY_STATE_STORE_PATH`: Path to the cache file (for file store)
//
// ## Example
//
// ```bash
// export DCAFFINITY_DOMAIN=corp.example.com
// export DCAFFINITY_BOOTSTRAP_DC=dc1.corp.example.com
// export DCAFFINITY_DC_SITES=dc1.corp.example.com=Paris,dc2.corp.example.com=Berlin
// export DCAFFINITY_STATE_STORE_TYPE=file
// export DCAFFINITY_STATE_STORE_PATH=/var/lib/dcaffinity/cache.json
//
// dcaffinityd
// ```

use anyhow::{Context, Result};
use dcaffinity_core::traits::{CacheStore, DcDiscovery};
use dcaffinity_core::{
    AffinityConfig, AffinityService, Collaborators, FileCacheStore, MachineCredentials,
    MemoryCacheStore, StateStoreConfig,
};
use dcaffinity_net::{SrvDiscovery, StaticDirectory, StaticDiscovery, TcpHeartbeat};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum DaemonExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<DaemonExitCode> for ExitCode {
    fn from(code: DaemonExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
struct Config {
    domain: String,
    bootstrap_dc: String,
    site_name: Option<String>,
    account: String,
    password: String,
    ha_enabled: bool,
    discovery_type: String,
    dc_list: Vec<String>,
    dc_sites: Vec<(String, String)>,
    supports_affinity: bool,
    heartbeat_interval_secs: Option<u64>,
    refresh_interval_secs: Option<u64>,
    probe_timeout_ms: Option<u64>,
    heartbeat_port: Option<u16>,
    dns_port: Option<u16>,
    state_store_type: String,
    state_store_path: Option<String>,
    log_level: String,
}

fn list(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} is not valid: '{}'", name, raw)),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let dc_sites = list("DCAFFINITY_DC_SITES")
            .into_iter()
            .map(|pair| match pair.split_once('=') {
                Some((dc, site)) => Ok((dc.trim().to_string(), site.trim().to_string())),
                None => anyhow::bail!("DCAFFINITY_DC_SITES entry '{}' is not dc=site", pair),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            domain: env::var("DCAFFINITY_DOMAIN").context("DCAFFINITY_DOMAIN is required")?,
            bootstrap_dc: env::var("DCAFFINITY_BOOTSTRAP_DC").context("DCAFFINITY_BOOTSTRAP_DC is required")?,
            site_name: env::var("DCAFFINITY_SITE_NAME").ok().filter(|s| !s.trim().is_empty()),
            account: env::var("DCAFFINITY_ACCOUNT").unwrap_or_default(),
            password: env::var("DCAFFINITY_PASSWORD").unwrap_or_default(),
            ha_enabled: parsed("DCAFFINITY_HA_ENABLED")?.unwrap_or(true),
            discovery_type: env::var("DCAFFINITY_DISCOVERY_TYPE").unwrap_or_else(|_| "dns".to_string()),
            dc_list: list("DCAFFINITY_DC_LIST"),
            dc_sites,
            supports_affinity: parsed("DCAFFINITY_SUPPORTS_AFFINITY")?.unwrap_or(true),
            heartbeat_interval_secs: parsed("DCAFFINITY_HEARTBEAT_INTERVAL_SECS")?,
            refresh_interval_secs: parsed("DCAFFINITY_REFRESH_INTERVAL_SECS")?,
            probe_timeout_ms: parsed("DCAFFINITY_PROBE_TIMEOUT_MS")?,
            heartbeat_port: parsed("DCAFFINITY_HEARTBEAT_PORT")?,
            dns_port: parsed("DCAFFINITY_DNS_PORT")?,
            state_store_type: env::var("DCAFFINITY_STATE_STORE_TYPE").unwrap_or_else(|_| "file".to_string()),
            state_store_path: env::var("DCAFFINITY_STATE_STORE_PATH").ok(),
            log_level: env::var("DCAFFINITY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the environment before anything starts
    fn validate(&self) -> Result<()> {
        validate_domain_name(&self.domain)?;
        validate_domain_name(self.bootstrap_dc.trim_end_matches('.'))?;

        match self.discovery_type.as_str() {
            "dns" => {}
            "static" if self.dc_list.is_empty() => anyhow::bail!(
                "DCAFFINITY_DC_LIST is required when DCAFFINITY_DISCOVERY_TYPE=static. \
                Set it via: export DCAFFINITY_DC_LIST=dc1.corp.example.com,dc2.corp.example.com"
            ),
            "static" => {}
            other => anyhow::bail!(
                "DCAFFINITY_DISCOVERY_TYPE '{}' is not supported. Supported types: dns, static",
                other
            ),
        }

        match self.state_store_type.as_str() {
            "memory" => {}
            "file" => match &self.state_store_path {
                Some(path) if !path.is_empty() => {
                    if let Some(parent) = std::path::Path::new(path).parent()
                        && !parent.as_os_str().is_empty()
                        && !parent.exists()
                    {
                        anyhow::bail!(
                            "DCAFFINITY_STATE_STORE_PATH parent directory does not exist: {}. \
                            Create it first: sudo mkdir -p {}",
                            parent.display(),
                            parent.display()
                        );
                    }
                }
                _ => anyhow::bail!(
                    "DCAFFINITY_STATE_STORE_PATH is required when DCAFFINITY_STATE_STORE_TYPE=file. \
                    Set it via: export DCAFFINITY_STATE_STORE_PATH=/var/lib/dcaffinity/cache.json"
                ),
            },
            other => anyhow::bail!(
                "DCAFFINITY_STATE_STORE_TYPE '{}' is not supported. Supported types: file, memory",
                other
            ),
        }

        if let Some(interval) = self.heartbeat_interval_secs
            && !(5..=3600).contains(&interval)
        {
            anyhow::bail!(
                "DCAFFINITY_HEARTBEAT_INTERVAL_SECS must be between 5 and 3600 seconds. Got: {}",
                interval
            );
        }

        if let Some(timeout) = self.probe_timeout_ms
            && !(100..=60_000).contains(&timeout)
        {
            anyhow::bail!(
                "DCAFFINITY_PROBE_TIMEOUT_MS must be between 100 and 60000. Got: {}",
                timeout
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "DCAFFINITY_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    fn affinity_config(&self) -> AffinityConfig {
        let mut config = AffinityConfig::new(&self.domain, &self.bootstrap_dc)
            .with_credentials(MachineCredentials::new(&self.account, &self.password));
        config.site_name = self.site_name.clone();
        config.ha_enabled = self.ha_enabled;

        if let Some(secs) = self.heartbeat_interval_secs {
            config.timing.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = self.refresh_interval_secs {
            config.timing.refresh_interval_secs = secs;
        }
        if let Some(ms) = self.probe_timeout_ms {
            config.probe.timeout_ms = ms;
        }
        if let Some(port) = self.heartbeat_port {
            config.probe.heartbeat_port = port;
        }
        if let Some(port) = self.dns_port {
            config.probe.dns_port = port;
        }
        config.state_store = match (&*self.state_store_type, &self.state_store_path) {
            ("file", Some(path)) => StateStoreConfig::File { path: path.clone() },
            _ => StateStoreConfig::Memory,
        };

        config
    }
}

/// Basic RFC 1035 name check; catches typos, not every invalid name
fn validate_domain_name(domain: &str) -> Result<()> {
    if domain.is_empty() {
        anyhow::bail!("Domain name cannot be empty");
    }
    if domain.len() > 253 {
        anyhow::bail!("Domain name too long: {} chars (max 253). Got: {}", domain.len(), domain);
    }

    for label in domain.split('.') {
        if label.is_empty() {
            anyhow::bail!("Domain name has empty label: '{}'", domain);
        }
        if label.len() > 63 {
            anyhow::bail!("Domain label too long: {} chars (max 63). Label: '{}'", label.len(), label);
        }
        if !label.chars().all(|c| c.is_alphanumeric() || c == '-') {
            anyhow::bail!(
                "Domain label contains invalid characters. Label: '{}'. \
                Valid: alphanumeric and hyphen only.",
                label
            );
        }
        if label.starts_with('-') || label.ends_with('-') {
            anyhow::bail!("Domain label cannot start or end with hyphen. Label: '{}'", label);
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return DaemonExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return DaemonExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return DaemonExitCode::ConfigError.into();
    }

    info!(domain = %config.domain, bootstrap_dc = %config.bootstrap_dc, "Starting dcaffinityd");

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return DaemonExitCode::RuntimeError.into();
        }
    };

    let code = rt.block_on(async {
        match run_daemon(config).await {
            Ok(()) => DaemonExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {:#}", e);
                DaemonExitCode::RuntimeError
            }
        }
    });

    code.into()
}

async fn build_store(config: &AffinityConfig) -> Result<Arc<dyn CacheStore>> {
    Ok(match &config.state_store {
        StateStoreConfig::File { path } => {
            info!(path = %path, "Using file cache store");
            Arc::new(FileCacheStore::new(path).await.context("opening cache file")?)
        }
        StateStoreConfig::Memory => {
            info!("Using in-memory cache store");
            Arc::new(MemoryCacheStore::new())
        }
    })
}

/// Run the daemon
async fn run_daemon(config: Config) -> Result<()> {
    let affinity = config.affinity_config();
    let store = build_store(&affinity).await?;
    let timeout = affinity.probe.timeout();

    let discovery: Arc<dyn DcDiscovery> = match config.discovery_type.as_str() {
        "static" => Arc::new(StaticDiscovery::new(config.dc_list.clone())),
        _ => Arc::new(SrvDiscovery::new(affinity.probe.dns_port, timeout)),
    };
    let heartbeat = Arc::new(TcpHeartbeat::new(affinity.probe.heartbeat_port, timeout));
    let directory = Arc::new(StaticDirectory::new(config.dc_sites.clone(), config.supports_affinity));
    info!(
        discovery = discovery.discovery_name(),
        sites = directory.len(),
        "Collaborators ready"
    );

    let service = AffinityService::new(affinity, Collaborators::new(store, discovery, heartbeat, directory))
        .await
        .context("building affinity service")?;

    let mut states = service.watch_state();
    let state_log = tokio::spawn(async move {
        while let Some(state) = states.next().await {
            info!(%state, "Affinity state");
        }
    });

    service.start().await?;
    info!("Daemon initialized successfully");

    let signal = wait_for_shutdown().await?;
    info!("Received shutdown signal: {}", signal);

    service.shutdown().await?;
    state_log.abort();
    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C; fallback for non-Unix platforms
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
