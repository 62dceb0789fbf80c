// # Directory Client Trait
//
// Directory (LDAP) round trips the agent needs:
// - the site a DC belongs to
// - whether the domain's functional level supports DC affinity
//
// Connection setup and teardown are the implementation's concern; each
// call is expected to open and close its own connection.

use async_trait::async_trait;

use crate::config::MachineCredentials;

/// Trait for directory clients
///
/// # Trust Level: Untrusted (Network Collaborator)
///
/// ## Allowed Capabilities
/// - ✅ Open a directory connection to a DC and run read-only queries
///
/// ## Forbidden Capabilities
/// - ❌ Write to the directory
/// - ❌ Write to the cache store
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Site name of `dc_name`
    async fn site_name(
        &self,
        dc_name: &str,
        domain: &str,
        credentials: &MachineCredentials,
    ) -> Result<String, crate::Error>;

    /// Whether the domain functional level supports affinity, asked of `dc_name`
    async fn supports_affinity(
        &self,
        dc_name: &str,
        domain: &str,
        credentials: &MachineCredentials,
    ) -> Result<bool, crate::Error>;
}
