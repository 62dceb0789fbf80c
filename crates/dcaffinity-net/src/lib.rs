// # dcaffinity-net
//
// Network-backed collaborators for the DC affinity agent.
//
// ## Contents
//
// - **SrvDiscovery**: `_ldap._tcp` SRV lookup sent straight to a DC's DNS service
// - **StaticDiscovery**: Fixed DC list, for labs without DNS
// - **TcpHeartbeat**: Liveness by TCP connect to the heartbeat port
// - **StaticDirectory**: Site map and functional level from configuration
//
// The core crate never depends on this one; the daemon wires them together.

mod directory;
mod discovery;
mod heartbeat;

pub use directory::StaticDirectory;
pub use discovery::{SrvDiscovery, StaticDiscovery};
pub use heartbeat::TcpHeartbeat;
