//! Request -> partition -> replica set resolution across regional endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meridian_types::{
    AddressCacheConfig, EpkRange, PartitionAddresses, PartitionKeyRange, PartitionKeyRangeIdentity,
    Protocol, ServerKey, StoreError,
};
use meridian_types::models::status_codes;
use tracing::{debug, info};
use url::Url;

use super::address_cache::{AddressCache, OpenConnectionsSummary};
use crate::error::{DriverError, DriverResult};
use crate::request::ServiceRequest;
use crate::routing::EndpointManager;
use crate::session::SessionContainer;
use crate::transport::{
    AddressResolver, AddressSource, ChannelOpener, CollectionCache, CollectionProperties,
    RoutingMapProvider,
};

/// Resolves the replica set of a request.
///
/// Keeps one [`AddressCache`] per regional service endpoint and routes each
/// request through the endpoint manager first.
pub struct PartitionAddressResolver {
    endpoint_manager: Arc<EndpointManager>,
    source: Arc<dyn AddressSource>,
    opener: Option<Arc<dyn ChannelOpener>>,
    collection_cache: Arc<dyn CollectionCache>,
    routing_map: Arc<dyn RoutingMapProvider>,
    session: Arc<SessionContainer>,
    protocol: Protocol,
    config: AddressCacheConfig,
    suboptimal_sweep: bool,
    caches: DashMap<Url, Arc<AddressCache>>,
}

impl PartitionAddressResolver {
    pub fn new(
        endpoint_manager: Arc<EndpointManager>,
        source: Arc<dyn AddressSource>,
        collection_cache: Arc<dyn CollectionCache>,
        routing_map: Arc<dyn RoutingMapProvider>,
        session: Arc<SessionContainer>,
        config: AddressCacheConfig,
    ) -> Self {
        Self {
            endpoint_manager,
            source,
            opener: None,
            collection_cache,
            routing_map,
            session,
            protocol: Protocol::default(),
            config,
            suboptimal_sweep: false,
            caches: DashMap::new(),
        }
    }

    pub fn with_channel_opener(mut self, opener: Arc<dyn ChannelOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Run a background suboptimal-partition sweep for every endpoint cache.
    pub fn with_suboptimal_sweep(mut self, enabled: bool) -> Self {
        self.suboptimal_sweep = enabled;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Address cache serving `endpoint`, created on first use.
    pub fn cache_for(&self, endpoint: &Url) -> Arc<AddressCache> {
        if let Some(cache) = self.caches.get(endpoint) {
            return Arc::clone(cache.value());
        }
        let entry = self
            .caches
            .entry(endpoint.clone())
            .or_insert_with(|| {
                let mut cache = AddressCache::new(
                    endpoint.clone(),
                    Arc::clone(&self.source),
                    self.protocol,
                    self.config,
                );
                if let Some(opener) = &self.opener {
                    cache = cache.with_channel_opener(Arc::clone(opener));
                }
                let cache = Arc::new(cache);
                if self.suboptimal_sweep {
                    // Detached: the sweep exits on shutdown or when the cache is dropped.
                    drop(cache.start_suboptimal_sweep());
                }
                cache
            });
        Arc::clone(entry.value())
    }

    /// Evict every cached partition with a replica on `server`, in every region.
    pub fn try_remove_addresses(&self, server: &ServerKey) -> usize {
        self.caches.iter().map(|c| c.value().try_remove_addresses(server)).sum()
    }

    /// Warm the address cache (and optionally channels) for every range of a collection.
    ///
    /// A collection that cannot be resolved is an error; per-range failures are only counted.
    pub async fn open_connections(
        &self,
        database_name: &str,
        collection_name: &str,
        should_open_channels: bool,
    ) -> DriverResult<OpenConnectionsSummary> {
        let full_name = format!("dbs/{database_name}/colls/{collection_name}");
        let collection = self.collection_cache.resolve_by_name(&full_name).await?;
        let ranges = self
            .routing_map
            .try_get_overlapping_ranges(&collection.rid, &EpkRange::full(), false)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("routing map for {full_name}")))?;
        let identities: Vec<PartitionKeyRangeIdentity> = ranges
            .iter()
            .map(|r| PartitionKeyRangeIdentity::new(collection.rid.clone(), r.id.clone()))
            .collect();

        let endpoint = self
            .endpoint_manager
            .read_endpoints()
            .first()
            .cloned()
            .unwrap_or_else(|| self.endpoint_manager.default_endpoint().clone());
        Ok(self.cache_for(&endpoint).open_connections(&collection, &identities, should_open_channels).await)
    }

    /// Stop background sweeps.
    pub fn shutdown(&self) {
        for cache in &self.caches {
            cache.value().shutdown();
        }
    }

    fn note_collection(&self, request: &mut ServiceRequest, collection: &CollectionProperties) {
        let previous = request.context.resolved_collection_rid.replace(collection.rid.clone());
        if let Some(previous) = previous.filter(|p| *p != collection.rid) {
            info!(
                collection = %collection.full_name,
                stale_rid = %previous,
                rid = %collection.rid,
                "Collection was recreated, dropping stale session tokens"
            );
            self.session.clear_token_by_resource_id(&previous);
            request.context.resolved_partition_key_range = None;
        }
    }

    async fn resolve_range(
        &self,
        request: &ServiceRequest,
        collection_rid: &str,
        force_refresh: bool,
    ) -> DriverResult<PartitionKeyRange> {
        let pinned = request
            .partition_key_range_identity
            .as_ref()
            .map(|i| i.partition_key_range_id.clone())
            .or_else(|| request.context.resolved_partition_key_range.as_ref().map(|r| r.id.clone()));

        if let Some(range_id) = pinned {
            return self
                .routing_map
                .try_get_range_by_id(collection_rid, &range_id, force_refresh)
                .await?
                .ok_or_else(|| {
                    StoreError::PartitionKeyRangeGone { message: format!("range {range_id} of {collection_rid}") }
                        .into()
                });
        }

        let ranges = self
            .routing_map
            .try_get_overlapping_ranges(collection_rid, &EpkRange::full(), force_refresh)
            .await?
            .ok_or_else(|| StoreError::InvalidPartition {
                message: format!("no routing map for collection {collection_rid}"),
            })?;
        match <[PartitionKeyRange; 1]>::try_from(ranges) {
            Ok([range]) => Ok(range),
            Err(ranges) if ranges.is_empty() => Err(StoreError::PartitionKeyRangeGone {
                message: format!("collection {collection_rid} has no ranges"),
            }
            .into()),
            Err(ranges) => Err(StoreError::Status {
                status: status_codes::BAD_REQUEST,
                sub_status: 0,
                message: format!("request must target one of {} partition key ranges", ranges.len()),
            }
            .into()),
        }
    }
}

#[async_trait]
impl AddressResolver for PartitionAddressResolver {
    async fn resolve(
        &self,
        request: &mut ServiceRequest,
        force_refresh: bool,
    ) -> DriverResult<PartitionAddresses> {
        request.check_live()?;
        let endpoint = self.endpoint_manager.resolve_service_endpoint(request);
        let cache = self.cache_for(&endpoint);
        let force_refresh = force_refresh || request.context.force_refresh_address_cache;

        if request.is_master_resource() {
            return cache
                .try_get_addresses(request, &PartitionKeyRangeIdentity::master(), force_refresh)
                .await?
                .ok_or_else(|| DriverError::NotFound(format!("master partition at {endpoint}")));
        }

        let collection = self.collection_cache.resolve_collection(request, false).await?;
        self.note_collection(request, &collection);

        let range = self.resolve_range(request, &collection.rid, false).await?;
        let identity = PartitionKeyRangeIdentity::new(collection.rid.clone(), range.id.clone());
        if let Some(addresses) = cache.try_get_addresses(request, &identity, force_refresh).await? {
            request.context.resolved_partition_key_range = Some(range);
            return Ok(addresses);
        }

        // The range may have split since the routing map was cached.
        debug!(identity = %identity, "No addresses for range, refreshing routing map");
        let range = self.resolve_range(request, &collection.rid, true).await?;
        let identity = PartitionKeyRangeIdentity::new(collection.rid.clone(), range.id.clone());
        let addresses = cache.try_get_addresses(request, &identity, true).await?.ok_or_else(|| {
            DriverError::from(StoreError::PartitionKeyRangeGone { message: format!("no addresses for {identity}") })
        })?;
        request.context.resolved_partition_key_range = Some(range);
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use meridian_types::{DriverConfig, OperationType, ResourceType};

    use super::*;
    use crate::testing::{
        replicas, FakeAddressSource, FakeChannelOpener, FakeCollectionCache, FakeRoutingMap,
        FakeTopologySource,
    };

    const COLLECTION: &str = "dbs/d/colls/c";

    struct Harness {
        source: Arc<FakeAddressSource>,
        collections: Arc<FakeCollectionCache>,
        routing: Arc<FakeRoutingMap>,
        session: Arc<SessionContainer>,
        resolver: PartitionAddressResolver,
    }

    fn harness(ranges: Vec<PartitionKeyRange>) -> Harness {
        let manager = EndpointManager::new(
            &DriverConfig::new("https://acct.example.net/"),
            Arc::new(FakeTopologySource::new()),
        )
        .unwrap();
        let source = Arc::new(
            FakeAddressSource::new()
                .with_range("0", replicas("0", 4))
                .with_range("1", replicas("1", 4))
                .with_range("2", replicas("2", 4))
                .with_master(replicas("M", 4)),
        );
        let collections = Arc::new(FakeCollectionCache::new().with_collection(COLLECTION, "rid1"));
        let routing = Arc::new(FakeRoutingMap::new().with_ranges("rid1", ranges));
        let session = Arc::new(SessionContainer::new());
        let resolver = PartitionAddressResolver::new(
            manager,
            source.clone(),
            collections.clone(),
            routing.clone(),
            session.clone(),
            AddressCacheConfig::default(),
        )
        .with_channel_opener(Arc::new(FakeChannelOpener::default()));
        Harness { source, collections, routing, session, resolver }
    }

    fn read() -> ServiceRequest {
        ServiceRequest::new(OperationType::Read, ResourceType::Document, format!("{COLLECTION}/docs/x"))
    }

    #[tokio::test]
    async fn test_single_range_collection_resolves() {
        let h = harness(vec![PartitionKeyRange::new("0", "", "FF")]);
        let mut request = read();

        let addresses = h.resolver.resolve(&mut request, false).await.unwrap();

        assert_eq!(addresses.identity, PartitionKeyRangeIdentity::new("rid1", "0"));
        assert_eq!(request.context.resolved_partition_key_range.unwrap().id, "0");
        assert_eq!(request.context.resolved_collection_rid.as_deref(), Some("rid1"));
    }

    #[tokio::test]
    async fn test_master_request_uses_master_partition() {
        let h = harness(vec![]);
        let mut request = ServiceRequest::new(OperationType::Read, ResourceType::Collection, COLLECTION);

        let addresses = h.resolver.resolve(&mut request, false).await.unwrap();

        assert!(addresses.identity.is_master());
        assert_eq!(h.collections.calls(), 0);
    }

    #[tokio::test]
    async fn test_split_range_refreshes_routing_map() {
        let h = harness(vec![PartitionKeyRange::new("0", "", "FF")]);
        let mut request = read().with_partition_key_range_identity(PartitionKeyRangeIdentity::new("rid1", "0"));
        h.resolver.resolve(&mut request, false).await.unwrap();

        // Range 0 split: the gateway no longer serves it.
        h.source.remove_range("0");
        let mut gone = read().with_partition_key_range_identity(PartitionKeyRangeIdentity::new("rid1", "0"));
        gone.context.force_refresh_address_cache = true;
        let err = h.resolver.resolve(&mut gone, false).await.unwrap_err();
        assert_eq!(err.failure_kind(), meridian_types::FailureKind::PartitionKeyRangeGone);
        assert_eq!(h.routing.forced_calls(), 1);

        h.routing.set_ranges(
            "rid1",
            vec![
                PartitionKeyRange::new("1", "", "7F").with_parents(["0"]),
                PartitionKeyRange::new("2", "7F", "FF").with_parents(["0"]),
            ],
        );
        let mut child = read().with_partition_key_range_identity(PartitionKeyRangeIdentity::new("rid1", "1"));
        let addresses = h.resolver.resolve(&mut child, false).await.unwrap();
        assert_eq!(addresses.identity.partition_key_range_id, "1");
    }

    #[tokio::test]
    async fn test_multi_range_without_target_is_bad_request() {
        let h = harness(vec![PartitionKeyRange::new("1", "", "7F"), PartitionKeyRange::new("2", "7F", "FF")]);
        let err = h.resolver.resolve(&mut read(), false).await.unwrap_err();
        assert_eq!(err.status_code(), Some(400));
    }

    #[tokio::test]
    async fn test_unknown_routing_map_is_invalid_partition() {
        let h = harness(vec![]);
        h.collections.set_collection(COLLECTION, "rid-unknown");
        let err = h.resolver.resolve(&mut read(), false).await.unwrap_err();
        assert_eq!(err.failure_kind(), meridian_types::FailureKind::InvalidPartition);
    }

    #[tokio::test]
    async fn test_recreated_collection_clears_stale_session() {
        let h = harness(vec![PartitionKeyRange::new("0", "", "FF")]);
        let mut request = read();
        h.session.set_session_token_for(
            "rid1",
            COLLECTION,
            &std::collections::HashMap::from([(
                meridian_types::models::headers::SESSION_TOKEN.to_string(),
                "0:1#9".to_string(),
            )]),
        );
        h.resolver.resolve(&mut request, false).await.unwrap();

        h.collections.set_collection(COLLECTION, "rid2");
        h.routing.set_ranges("rid2", vec![PartitionKeyRange::new("0", "", "FF")]);
        h.resolver.resolve(&mut request, false).await.unwrap();

        assert_eq!(request.context.resolved_collection_rid.as_deref(), Some("rid2"));
        assert_eq!(h.session.resolve_global_session_token(&read()), "");
    }

    #[tokio::test]
    async fn test_open_connections() {
        let h = harness(vec![PartitionKeyRange::new("1", "", "7F"), PartitionKeyRange::new("2", "7F", "FF")]);

        let summary = h.resolver.open_connections("d", "c", true).await.unwrap();
        assert_eq!(summary.resolved, 2);
        assert_eq!(summary.channels_opened, 8);

        let err = h.resolver.open_connections("d", "missing", true).await.unwrap_err();
        assert!(matches!(err, DriverError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_resolver_releases_swept_caches() {
        let h = harness(vec![PartitionKeyRange::new("0", "", "FF")]);
        let resolver = h.resolver.with_suboptimal_sweep(true);
        resolver.resolve(&mut read(), false).await.unwrap();

        let cache = Arc::downgrade(&resolver.cache_for(&Url::parse("https://acct.example.net/").unwrap()));
        assert_eq!(cache.strong_count(), 1);

        drop(resolver);
        assert!(cache.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_remove_addresses_across_regions() {
        let h = harness(vec![PartitionKeyRange::new("0", "", "FF")]);
        h.resolver.resolve(&mut read(), false).await.unwrap();
        let before = h.source.calls();

        assert_eq!(h.resolver.try_remove_addresses(&ServerKey::new("node2.example.net", 10302)), 1);
        h.resolver.resolve(&mut read(), false).await.unwrap();
        assert_eq!(h.source.calls(), before + 1);
    }
}
