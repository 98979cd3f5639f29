//! Account topology as reported by the account endpoint.

use serde::{Deserialize, Serialize};
use url::Url;

/// One region entry of the account topology.
///
/// The endpoint is kept as the raw string received so a malformed entry can be
/// skipped (and logged) without rejecting the whole topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountRegion {
    pub name: String,
    #[serde(rename = "databaseAccountEndpoint")]
    pub endpoint: String,
}

impl AccountRegion {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self { name: name.into(), endpoint: endpoint.into() }
    }
}

/// Result of an account topology fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountTopology {
    /// Write regions in account failover-priority order
    #[serde(default)]
    pub writable_locations: Vec<AccountRegion>,
    /// Read regions in account order; a superset of the write regions
    #[serde(default)]
    pub readable_locations: Vec<AccountRegion>,
    /// Server-side multi-region-write switch
    #[serde(default)]
    pub enable_multiple_write_locations: bool,
}

/// A parsed region endpoint with its roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionEndpoint {
    pub name: String,
    pub uri: Url,
    pub is_write_region: bool,
    pub is_read_region: bool,
}

impl AccountTopology {
    /// Flatten the topology into role-annotated endpoints, read order first.
    ///
    /// Entries with an empty name or unparseable endpoint are dropped.
    pub fn region_endpoints(&self) -> Vec<RegionEndpoint> {
        let mut out: Vec<RegionEndpoint> = Vec::new();
        for region in &self.readable_locations {
            let Ok(uri) = Url::parse(&region.endpoint) else { continue };
            if region.name.is_empty() {
                continue;
            }
            out.push(RegionEndpoint {
                name: region.name.clone(),
                uri,
                is_write_region: self.is_write_region(&region.name),
                is_read_region: true,
            });
        }
        for region in &self.writable_locations {
            if out.iter().any(|e| e.name.eq_ignore_ascii_case(&region.name)) {
                continue;
            }
            let Ok(uri) = Url::parse(&region.endpoint) else { continue };
            if region.name.is_empty() {
                continue;
            }
            out.push(RegionEndpoint {
                name: region.name.clone(),
                uri,
                is_write_region: true,
                is_read_region: false,
            });
        }
        out
    }

    fn is_write_region(&self, name: &str) -> bool {
        self.writable_locations.iter().any(|w| w.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_account_payload() {
        let json = r#"{
            "writableLocations": [{"name": "West US", "databaseAccountEndpoint": "https://acct-westus.example.net/"}],
            "readableLocations": [
                {"name": "West US", "databaseAccountEndpoint": "https://acct-westus.example.net/"},
                {"name": "East US", "databaseAccountEndpoint": "https://acct-eastus.example.net/"}
            ],
            "enableMultipleWriteLocations": false
        }"#;
        let topology: AccountTopology = serde_json::from_str(json).unwrap();
        assert_eq!(topology.writable_locations.len(), 1);
        assert_eq!(topology.readable_locations[1].name, "East US");

        let endpoints = topology.region_endpoints();
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints[0].is_write_region);
        assert!(!endpoints[1].is_write_region);
        assert!(endpoints[1].is_read_region);
    }

    #[test]
    fn test_malformed_endpoint_skipped() {
        let topology = AccountTopology {
            writable_locations: vec![],
            readable_locations: vec![
                AccountRegion::new("West US", "not a url"),
                AccountRegion::new("", "https://x.example.net/"),
                AccountRegion::new("East US", "https://acct-eastus.example.net/"),
            ],
            enable_multiple_write_locations: false,
        };
        let endpoints = topology.region_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].name, "East US");
    }
}
