use std::sync::Arc;

use async_trait::async_trait;
use meridian_types::{EpkRange, FailureKind};
use tracing::{info, warn};

use super::{defer_to, FailureSignal, RetryPolicy, ShouldRetryResult};
use crate::request::ServiceRequest;
use crate::transport::{CollectionCache, RoutingMapProvider};

/// Refreshes the routing map once when a partition range has split or moved.
pub struct PartitionKeyRangeGoneRetryPolicy {
    collection_cache: Arc<dyn CollectionCache>,
    routing_map: Arc<dyn RoutingMapProvider>,
    retried: bool,
    refresh_addresses: bool,
    next: Option<Box<dyn RetryPolicy>>,
}

impl PartitionKeyRangeGoneRetryPolicy {
    pub fn new(collection_cache: Arc<dyn CollectionCache>, routing_map: Arc<dyn RoutingMapProvider>) -> Self {
        Self { collection_cache, routing_map, retried: false, refresh_addresses: false, next: None }
    }

    pub fn with_next(mut self, next: Box<dyn RetryPolicy>) -> Self {
        self.next = Some(next);
        self
    }
}

#[async_trait]
impl RetryPolicy for PartitionKeyRangeGoneRetryPolicy {
    fn on_before_send_request(&mut self, request: &mut ServiceRequest) {
        if self.refresh_addresses {
            request.context.force_refresh_address_cache = true;
            request.context.resolved_partition_key_range = None;
            self.refresh_addresses = false;
        }
        if let Some(next) = self.next.as_mut() {
            next.on_before_send_request(request);
        }
    }

    async fn should_retry(&mut self, request: &ServiceRequest, failure: &FailureSignal) -> ShouldRetryResult {
        if failure.kind != FailureKind::PartitionKeyRangeGone || self.retried {
            return defer_to(&mut self.next, request, failure).await;
        }
        self.retried = true;

        let collection = match self.collection_cache.resolve_collection(request, false).await {
            Ok(collection) => collection,
            Err(e) => {
                warn!(error = %e, resource = %request.resource_address, "Could not resolve collection after range gone");
                return defer_to(&mut self.next, request, failure).await;
            },
        };
        if let Err(e) = self.routing_map.try_get_overlapping_ranges(&collection.rid, &EpkRange::full(), true).await {
            warn!(error = %e, collection = %collection.rid, "Routing map refresh failed");
            return defer_to(&mut self.next, request, failure).await;
        }

        info!(collection = %collection.rid, sub_status = ?failure.sub_status, "Partition range gone, retrying with refreshed routing map");
        self.refresh_addresses = true;
        ShouldRetryResult::retry_now()
    }
}
