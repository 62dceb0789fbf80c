// # DC Discovery Trait
//
// Lists the domain controllers of a domain, typically from the
// `_ldap._tcp.<domain>` SRV records served by a DC's DNS service.
//
// ## Usage
//
// ```rust
// use dcaffinity_core::traits::DcDiscovery;
//
// async fn example(discovery: &dyn DcDiscovery) -> dcaffinity_core::Result<()> {
//     let dcs = discovery.discover_dcs("dc1.corp.example.com", "corp.example.com").await?;
//     println!("{} DCs", dcs.len());
//     Ok(())
// }
// ```

use async_trait::async_trait;

/// SRV service label queried for DCs
pub const LDAP_SRV_PREFIX: &str = "_ldap._tcp";

/// SRV owner name for a domain's DCs
pub fn ldap_srv_name(domain: &str) -> String {
    format!("{}.{}", LDAP_SRV_PREFIX, domain.trim_end_matches('.'))
}

/// Trait for DC discovery implementations
///
/// Returned names may carry a trailing `.` and duplicates; callers
/// normalize them.
///
/// # Trust Level: Untrusted (Network Collaborator)
///
/// ## Forbidden Capabilities
/// - ❌ Probe the DCs it returns
/// - ❌ Write to the cache store
#[async_trait]
pub trait DcDiscovery: Send + Sync {
    /// Query the DNS server on `server` for the DCs of `domain`
    ///
    /// # Returns
    ///
    /// - `Ok(names)`: SRV targets, possibly empty
    /// - `Err(Error)`: the server could not be queried
    async fn discover_dcs(&self, server: &str, domain: &str) -> Result<Vec<String>, crate::Error>;

    /// Short name for logs
    fn discovery_name(&self) -> &'static str;
}
