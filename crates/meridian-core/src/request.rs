//! Outgoing request and its mutable routing context.

use std::collections::HashMap;
use std::time::Duration;

use meridian_types::models::headers;
use meridian_types::{
    ConsistencyLevel, OperationType, PartitionKeyRange, PartitionKeyRangeIdentity, ResourceType,
    StoreResponse,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{DriverError, DriverResult};
use crate::session::SessionToken;

/// Routing and consistency state a request accumulates across retries.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Position in the applicable endpoint list (manual failover flip-flop for writes)
    pub location_index_to_route: usize,
    /// `false` routes writes-style to the account write regions
    pub use_preferred_locations: bool,
    /// Set by endpoint resolution; an explicit value short-circuits it
    pub location_endpoint_to_route: Option<Url>,
    /// Region names this request must not be routed to
    pub exclude_regions: Vec<String>,
    pub resolved_partition_key_range: Option<PartitionKeyRange>,
    pub resolved_collection_rid: Option<String>,
    pub force_refresh_address_cache: bool,
    /// Address cache generation each partition was last resolved from
    pub address_generations: HashMap<PartitionKeyRangeIdentity, u64>,
    pub quorum_selected_lsn: i64,
    pub global_committed_selected_lsn: i64,
    pub quorum_selected_store_response: Option<StoreResponse>,
    /// Replica endpoints that failed earlier in this request
    pub failed_endpoints: Vec<Url>,
    /// Partition-local session token the request must satisfy
    pub session_token: Option<SessionToken>,
    pub performed_background_address_refresh: bool,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            location_index_to_route: 0,
            use_preferred_locations: true,
            location_endpoint_to_route: None,
            exclude_regions: Vec::new(),
            resolved_partition_key_range: None,
            resolved_collection_rid: None,
            force_refresh_address_cache: false,
            address_generations: HashMap::new(),
            quorum_selected_lsn: -1,
            global_committed_selected_lsn: -1,
            quorum_selected_store_response: None,
            failed_endpoints: Vec::new(),
            session_token: None,
            performed_background_address_refresh: false,
        }
    }
}

impl RequestContext {
    /// Pin the next resolution to `index` of the applicable endpoint list.
    pub fn route_to_location_index(&mut self, index: usize, use_preferred_locations: bool) {
        self.location_index_to_route = index;
        self.use_preferred_locations = use_preferred_locations;
        self.location_endpoint_to_route = None;
    }

    pub fn route_to_location(&mut self, endpoint: Url) {
        self.location_endpoint_to_route = Some(endpoint);
    }

    pub fn clear_route_to_location(&mut self) {
        self.location_index_to_route = 0;
        self.use_preferred_locations = true;
        self.location_endpoint_to_route = None;
    }

    pub fn add_failed_endpoint(&mut self, endpoint: Url) {
        if !self.failed_endpoints.contains(&endpoint) {
            self.failed_endpoints.push(endpoint);
        }
    }
}

/// One logical operation as seen by routing and the quorum protocol.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
    /// Name path (`dbs/x/colls/y/...`) or resource id
    pub resource_address: String,
    pub resource_id: Option<String>,
    pub is_name_based: bool,
    pub headers: HashMap<String, String>,
    pub consistency_level: Option<ConsistencyLevel>,
    pub activity_id: String,
    /// Explicit partition target; skips range resolution
    pub partition_key_range_identity: Option<PartitionKeyRangeIdentity>,
    /// Read the primary replica regardless of consistency level
    pub pin_to_primary: bool,
    pub context: RequestContext,
    pub deadline: Option<Instant>,
    pub cancellation: CancellationToken,
}

impl ServiceRequest {
    pub fn new(
        operation_type: OperationType,
        resource_type: ResourceType,
        resource_address: impl Into<String>,
    ) -> Self {
        Self {
            operation_type,
            resource_type,
            resource_address: resource_address.into(),
            resource_id: None,
            is_name_based: true,
            headers: HashMap::new(),
            consistency_level: None,
            activity_id: uuid::Uuid::new_v4().to_string(),
            partition_key_range_identity: None,
            pin_to_primary: false,
            context: RequestContext::default(),
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Request addressed by resource id rather than by name.
    pub fn with_resource_id(mut self, rid: impl Into<String>) -> Self {
        self.resource_id = Some(rid.into());
        self.is_name_based = false;
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn with_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.consistency_level = Some(level);
        self
    }

    pub fn with_partition_key_range_identity(mut self, identity: PartitionKeyRangeIdentity) -> Self {
        self.partition_key_range_identity = Some(identity);
        self
    }

    pub fn with_exclude_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context.exclude_regions = regions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn pinned_to_primary(mut self) -> Self {
        self.pin_to_primary = true;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.operation_type.is_read_only()
    }

    /// Check if the request targets master (metadata) resources.
    pub fn is_master_resource(&self) -> bool {
        self.resource_type.is_reading_from_master(self.operation_type)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn session_token_header(&self) -> Option<&str> {
        self.header(headers::SESSION_TOKEN)
    }

    /// Collection full name (`dbs/{db}/colls/{coll}`) of a name-based address.
    pub fn collection_name(&self) -> Option<String> {
        collection_name_from_path(&self.resource_address)
    }

    /// Fail fast if the caller cancelled.
    pub fn check_live(&self) -> DriverResult<()> {
        if self.cancellation.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        Ok(())
    }

    pub fn is_past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left until the deadline (`None` when unbounded).
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Sleep for `delay`, cut short at the deadline, unless cancelled first.
    pub async fn sleep(&self, delay: Duration) -> DriverResult<()> {
        let delay = self.remaining().map_or(delay, |left| delay.min(left));
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = self.cancellation.cancelled() => Err(DriverError::Cancelled),
        }
    }

    /// Completes when the deadline passes; never for an unbounded request.
    pub async fn deadline_elapsed(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

/// Extract `dbs/{db}/colls/{coll}` from a resource path.
pub fn collection_name_from_path(path: &str) -> Option<String> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if segments.len() < 4 || segments[0] != "dbs" || segments[2] != "colls" {
        return None;
    }
    Some(format!("dbs/{}/colls/{}", segments[1], segments[3]))
}
