// # Static Directory
//
// Directory client answering from configuration: a DC-to-site map and a
// fixed answer to the functional level query. DC names match without
// regard to case or a trailing dot.

use async_trait::async_trait;
use dcaffinity_core::config::MachineCredentials;
use dcaffinity_core::traits::DirectoryClient;
use dcaffinity_core::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct StaticDirectory {
    sites: HashMap<String, String>,
    supports_affinity: bool,
}

fn key(dc_name: &str) -> String {
    dc_name.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl StaticDirectory {
    pub fn new<I, D, S>(sites: I, supports_affinity: bool) -> Self
    where
        I: IntoIterator<Item = (D, S)>,
        D: AsRef<str>,
        S: Into<String>,
    {
        Self {
            sites: sites
                .into_iter()
                .map(|(dc, site)| (key(dc.as_ref()), site.into()))
                .collect(),
            supports_affinity,
        }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

#[async_trait]
impl DirectoryClient for StaticDirectory {
    async fn site_name(&self, dc_name: &str, _domain: &str, _credentials: &MachineCredentials) -> Result<String> {
        self.sites
            .get(&key(dc_name))
            .cloned()
            .ok_or_else(|| Error::directory(format!("no site configured for {}", dc_name)))
    }

    async fn supports_affinity(&self, _dc_name: &str, _domain: &str, _credentials: &MachineCredentials) -> Result<bool> {
        Ok(self.supports_affinity)
    }
}
