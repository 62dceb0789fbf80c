// # SRV Discovery
//
// Asks the DNS service of one DC for the `_ldap._tcp.<domain>` SRV records.
// The query goes to that DC directly, never to the system resolver, so the
// answer reflects what the DC currently advertises.

use async_trait::async_trait;
use dcaffinity_core::traits::{DcDiscovery, ldap_srv_name};
use dcaffinity_core::{Error, Result};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use std::cmp::Reverse;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// SRV discovery against a DC's DNS service
#[derive(Debug, Clone)]
pub struct SrvDiscovery {
    dns_port: u16,
    timeout: Duration,
}

impl SrvDiscovery {
    pub fn new(dns_port: u16, timeout: Duration) -> Self {
        Self { dns_port, timeout }
    }

    async fn server_ips(&self, server: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = server.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = tokio::time::timeout(self.timeout, tokio::net::lookup_host((server, self.dns_port)))
            .await
            .map_err(|_| Error::discovery(format!("resolving {} timed out", server)))?
            .map_err(|e| Error::discovery(format!("resolving {}: {}", server, e)))?;

        let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        ips.dedup();
        if ips.is_empty() {
            return Err(Error::discovery(format!("{} has no address", server)));
        }
        Ok(ips)
    }

    fn resolver(&self, ips: &[IpAddr]) -> TokioAsyncResolver {
        let servers = NameServerConfigGroup::from_ips_clear(ips, self.dns_port, true);
        let config = ResolverConfig::from_parts(None, vec![], servers);

        let mut opts = ResolverOpts::default();
        opts.timeout = self.timeout;
        opts.attempts = 1;
        opts.cache_size = 0;

        TokioAsyncResolver::tokio(config, opts)
    }
}

#[async_trait]
impl DcDiscovery for SrvDiscovery {
    async fn discover_dcs(&self, server: &str, domain: &str) -> Result<Vec<String>> {
        let ips = self.server_ips(server).await?;
        let name = ldap_srv_name(domain);

        let lookup = match self.resolver(&ips).srv_lookup(name.as_str()).await {
            Ok(lookup) => lookup,
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                debug!(server, srv = %name, "No SRV records");
                return Ok(Vec::new());
            }
            Err(e) => return Err(Error::discovery(format!("{} via {}: {}", name, server, e))),
        };

        let mut records: Vec<_> = lookup.iter().collect();
        records.sort_by_key(|srv| (srv.priority(), Reverse(srv.weight())));
        let names: Vec<String> = records.iter().map(|srv| srv.target().to_utf8()).collect();

        debug!(server, srv = %name, count = names.len(), "SRV lookup finished");
        Ok(names)
    }

    fn discovery_name(&self) -> &'static str {
        "dns-srv"
    }
}

/// Fixed DC list; ignores the server it is asked through
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    dcs: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(dcs: Vec<String>) -> Self {
        Self { dcs }
    }
}

#[async_trait]
impl DcDiscovery for StaticDiscovery {
    async fn discover_dcs(&self, _server: &str, _domain: &str) -> Result<Vec<String>> {
        Ok(self.dcs.clone())
    }

    fn discovery_name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_list_returned_as_configured() {
        let discovery = StaticDiscovery::new(vec!["dc1.corp.example.com".to_string()]);
        let dcs = discovery.discover_dcs("ignored", "corp.example.com").await.unwrap();
        assert_eq!(dcs, vec!["dc1.corp.example.com"]);
    }

    #[tokio::test]
    async fn literal_server_address_skips_lookup() {
        let discovery = SrvDiscovery::new(53, Duration::from_millis(200));
        let ips = discovery.server_ips("192.0.2.10").await.unwrap();
        assert_eq!(ips, vec!["192.0.2.10".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn unreachable_dns_service_is_a_discovery_error() {
        // Nothing listens on the discard port of the loopback address
        let discovery = SrvDiscovery::new(9, Duration::from_millis(200));
        let result = discovery.discover_dcs("127.0.0.1", "corp.example.com").await;
        assert!(matches!(result, Err(Error::Discovery(_))));
    }
}
