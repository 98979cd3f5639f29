//! Physical replica addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use super::partition::PartitionKeyRangeIdentity;

/// Transport protocol a replica address speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Binary direct protocol
    #[default]
    Rntbd,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Rntbd => write!(f, "rntbd"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// One replica of a partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaAddress {
    pub physical_uri: Url,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub protocol: Protocol,
    pub partition_key_range_id: String,
}

impl ReplicaAddress {
    pub fn server_key(&self) -> Option<ServerKey> {
        ServerKey::from_url(&self.physical_uri)
    }
}

/// Low-level connection identity (`host:port`) shared by every replica on one server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerKey {
    pub host: String,
    pub port: u16,
}

impl ServerKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into().to_ascii_lowercase(), port }
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(Self::new(host, port))
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Replica set of one partition as returned by the last topology fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAddresses {
    pub identity: PartitionKeyRangeIdentity,
    pub replicas: Vec<ReplicaAddress>,
}

impl PartitionAddresses {
    pub fn new(identity: PartitionKeyRangeIdentity, replicas: Vec<ReplicaAddress>) -> Self {
        Self { identity, replicas }
    }

    pub fn primary(&self) -> Option<&ReplicaAddress> {
        self.replicas.iter().find(|r| r.is_primary)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Replicas speaking `protocol`, optionally without the primary.
    pub fn for_protocol(&self, protocol: Protocol, include_primary: bool) -> Vec<ReplicaAddress> {
        self.replicas
            .iter()
            .filter(|r| r.protocol == protocol && (include_primary || !r.is_primary))
            .cloned()
            .collect()
    }

    pub fn references_server(&self, key: &ServerKey) -> bool {
        self.replicas.iter().any(|r| r.server_key().as_ref() == Some(key))
    }
}
