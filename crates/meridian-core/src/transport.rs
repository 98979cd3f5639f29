//! Collaborator seams.
//!
//! Everything the core consumes from the outside world is a narrow async trait:
//! the per-replica transport, the account and address gateways, the partition
//! routing map, and the collection name cache. Production implementations of
//! the two gateway sources live in [`crate::gateway`].

use async_trait::async_trait;
use meridian_types::{
    AccountTopology, EpkRange, PartitionAddresses, PartitionKeyRange, ReplicaAddress, StoreError,
    StoreResponse,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DriverResult;
use crate::request::ServiceRequest;

/// Sends one request to one physical replica.
///
/// Transport-level failures (reset, timeout) come back as `Err`; a replica that
/// answered with a failure status comes back as `Ok` with that status so its
/// LSNs stay visible to the quorum logic.
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn invoke(
        &self,
        address: &ReplicaAddress,
        request: &ServiceRequest,
    ) -> Result<StoreResponse, StoreError>;
}

/// Reads the account topology from an account endpoint.
#[async_trait]
pub trait AccountTopologySource: Send + Sync {
    async fn get_account_topology(&self, endpoint: &Url) -> DriverResult<AccountTopology>;
}

/// Fetches replica addresses from the address gateway of one service endpoint.
#[async_trait]
pub trait AddressSource: Send + Sync {
    /// Replicas of the given ranges of a collection, flattened; each address
    /// carries its own range id.
    async fn get_addresses(
        &self,
        service_endpoint: &Url,
        collection_rid: &str,
        partition_key_range_ids: &[String],
        force_refresh: bool,
    ) -> DriverResult<Vec<ReplicaAddress>>;

    /// Replicas of the master partition.
    async fn get_master_addresses(
        &self,
        service_endpoint: &Url,
        force_refresh: bool,
    ) -> DriverResult<Vec<ReplicaAddress>>;
}

/// Partition key range lookup for a collection.
#[async_trait]
pub trait RoutingMapProvider: Send + Sync {
    /// Ranges overlapping `range`, or `None` if the collection's routing map is unknown.
    async fn try_get_overlapping_ranges(
        &self,
        collection_rid: &str,
        range: &EpkRange,
        force_refresh: bool,
    ) -> DriverResult<Option<Vec<PartitionKeyRange>>>;

    async fn try_get_range_by_id(
        &self,
        collection_rid: &str,
        partition_key_range_id: &str,
        force_refresh: bool,
    ) -> DriverResult<Option<PartitionKeyRange>>;
}

/// Identity of a resolved collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionProperties {
    pub rid: String,
    /// `dbs/{db}/colls/{coll}`
    pub full_name: String,
}

/// Collection name cache.
#[async_trait]
pub trait CollectionCache: Send + Sync {
    /// Resolve the collection a request addresses.
    async fn resolve_collection(
        &self,
        request: &ServiceRequest,
        force_refresh: bool,
    ) -> DriverResult<CollectionProperties>;

    /// Resolve a collection by full name.
    async fn resolve_by_name(&self, collection_full_name: &str) -> DriverResult<CollectionProperties>;
}

/// Pre-opens transport channels.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// One result per address, in input order.
    async fn try_open_channels(&self, addresses: &[ReplicaAddress]) -> Vec<Result<(), StoreError>>;
}

/// Resolves the replica set a request targets.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(
        &self,
        request: &mut ServiceRequest,
        force_refresh: bool,
    ) -> DriverResult<PartitionAddresses>;
}
