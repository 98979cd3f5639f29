//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use meridian_types::{
    AccountTopology, EpkRange, OperationType, PartitionAddresses, PartitionKeyRange,
    PartitionKeyRangeIdentity, Protocol, ReplicaAddress, StoreError, StoreResponse,
};
use parking_lot::Mutex;
use url::Url;

use crate::error::{DriverError, DriverResult};
use crate::request::ServiceRequest;
use crate::transport::{
    AccountTopologySource, AddressResolver, AddressSource, ChannelOpener, CollectionCache,
    CollectionProperties, RoutingMapProvider, TransportClient,
};

fn key(endpoint: &Url) -> String {
    endpoint.as_str().trim_end_matches('/').to_string()
}

fn parse(endpoint: &str) -> Url {
    Url::parse(endpoint).unwrap()
}

/// `count` replicas of `range_id`; the first is primary.
pub fn replicas(range_id: &str, count: usize) -> Vec<ReplicaAddress> {
    (0..count)
        .map(|i| ReplicaAddress {
            physical_uri: parse(&format!(
                "rntbd://node{i}.example.net:1030{i}/apps/a/services/s/partitions/{range_id}/replicas/{i}/"
            )),
            is_primary: i == 0,
            protocol: Protocol::Rntbd,
            partition_key_range_id: range_id.to_string(),
        })
        .collect()
}

// ============================================================================
// Topology
// ============================================================================

#[derive(Default)]
pub struct FakeTopologySource {
    topologies: DashMap<String, AccountTopology>,
    delay: Duration,
    calls: AtomicUsize,
    requested: Mutex<Vec<Url>>,
}

impl FakeTopologySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topology(self, endpoint: &str, topology: AccountTopology) -> Self {
        self.topologies.insert(key(&parse(endpoint)), topology);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<Url> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl AccountTopologySource for FakeTopologySource {
    async fn get_account_topology(&self, endpoint: &Url) -> DriverResult<AccountTopology> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().push(endpoint.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.topologies
            .get(&key(endpoint))
            .map(|t| t.clone())
            .ok_or_else(|| DriverError::Network(format!("no route to {endpoint}")))
    }
}

// ============================================================================
// Addresses
// ============================================================================

#[derive(Default)]
pub struct FakeAddressSource {
    ranges: DashMap<String, Vec<ReplicaAddress>>,
    master: Mutex<Vec<ReplicaAddress>>,
    failure: Mutex<Option<DriverError>>,
    delay: Duration,
    calls: AtomicUsize,
    batches: Mutex<Vec<Vec<String>>>,
    forced: AtomicUsize,
}

impl FakeAddressSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(self, range_id: &str, replicas: Vec<ReplicaAddress>) -> Self {
        self.set_range(range_id, replicas);
        self
    }

    pub fn with_master(self, replicas: Vec<ReplicaAddress>) -> Self {
        *self.master.lock() = replicas;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_range(&self, range_id: &str, replicas: Vec<ReplicaAddress>) {
        self.ranges.insert(range_id.to_string(), replicas);
    }

    pub fn remove_range(&self, range_id: &str) {
        self.ranges.remove(range_id);
    }

    pub fn fail_with(&self, error: Option<DriverError>) {
        *self.failure.lock() = error;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn forced_calls(&self) -> usize {
        self.forced.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }

    async fn begin(&self, force_refresh: bool) -> DriverResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if force_refresh {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AddressSource for FakeAddressSource {
    async fn get_addresses(
        &self,
        _service_endpoint: &Url,
        _collection_rid: &str,
        partition_key_range_ids: &[String],
        force_refresh: bool,
    ) -> DriverResult<Vec<ReplicaAddress>> {
        self.batches.lock().push(partition_key_range_ids.to_vec());
        self.begin(force_refresh).await?;
        Ok(partition_key_range_ids
            .iter()
            .filter_map(|id| self.ranges.get(id).map(|r| r.clone()))
            .flatten()
            .collect())
    }

    async fn get_master_addresses(
        &self,
        _service_endpoint: &Url,
        force_refresh: bool,
    ) -> DriverResult<Vec<ReplicaAddress>> {
        self.begin(force_refresh).await?;
        Ok(self.master.lock().clone())
    }
}

#[derive(Default)]
pub struct FakeChannelOpener {
    failing_hosts: HashSet<String>,
    opened: Mutex<Vec<Url>>,
}

impl FakeChannelOpener {
    pub fn failing_on<I: IntoIterator<Item = &'static str>>(hosts: I) -> Self {
        Self { failing_hosts: hosts.into_iter().map(str::to_string).collect(), ..Self::default() }
    }

    pub fn opened(&self) -> Vec<Url> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl ChannelOpener for FakeChannelOpener {
    async fn try_open_channels(&self, addresses: &[ReplicaAddress]) -> Vec<Result<(), StoreError>> {
        addresses
            .iter()
            .map(|a| {
                let host = a.physical_uri.host_str().unwrap_or_default();
                if self.failing_hosts.contains(host) {
                    Err(StoreError::ConnectionReset {
                        endpoint: a.physical_uri.to_string(),
                        message: "refused".to_string(),
                    })
                } else {
                    self.opened.lock().push(a.physical_uri.clone());
                    Ok(())
                }
            })
            .collect()
    }
}

// ============================================================================
// Collections and routing maps
// ============================================================================

#[derive(Default)]
pub struct FakeRoutingMap {
    ranges: DashMap<String, Vec<PartitionKeyRange>>,
    calls: AtomicUsize,
    forced: AtomicUsize,
}

impl FakeRoutingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ranges(self, collection_rid: &str, ranges: Vec<PartitionKeyRange>) -> Self {
        self.set_ranges(collection_rid, ranges);
        self
    }

    pub fn set_ranges(&self, collection_rid: &str, ranges: Vec<PartitionKeyRange>) {
        self.ranges.insert(collection_rid.to_string(), ranges);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn forced_calls(&self) -> usize {
        self.forced.load(Ordering::SeqCst)
    }

    fn record(&self, force_refresh: bool) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if force_refresh {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RoutingMapProvider for FakeRoutingMap {
    async fn try_get_overlapping_ranges(
        &self,
        collection_rid: &str,
        range: &EpkRange,
        force_refresh: bool,
    ) -> DriverResult<Option<Vec<PartitionKeyRange>>> {
        self.record(force_refresh);
        Ok(self.ranges.get(collection_rid).map(|ranges| {
            let mut overlapping: Vec<PartitionKeyRange> =
                ranges.iter().filter(|r| r.to_range().overlaps(range)).cloned().collect();
            overlapping.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
            overlapping
        }))
    }

    async fn try_get_range_by_id(
        &self,
        collection_rid: &str,
        partition_key_range_id: &str,
        force_refresh: bool,
    ) -> DriverResult<Option<PartitionKeyRange>> {
        self.record(force_refresh);
        Ok(self
            .ranges
            .get(collection_rid)
            .and_then(|ranges| ranges.iter().find(|r| r.id == partition_key_range_id).cloned()))
    }
}

#[derive(Default)]
pub struct FakeCollectionCache {
    by_name: DashMap<String, CollectionProperties>,
    calls: AtomicUsize,
}

impl FakeCollectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(self, full_name: &str, rid: &str) -> Self {
        self.set_collection(full_name, rid);
        self
    }

    pub fn set_collection(&self, full_name: &str, rid: &str) {
        self.by_name.insert(
            full_name.to_string(),
            CollectionProperties { rid: rid.to_string(), full_name: full_name.to_string() },
        );
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CollectionCache for FakeCollectionCache {
    async fn resolve_collection(
        &self,
        request: &ServiceRequest,
        _force_refresh: bool,
    ) -> DriverResult<CollectionProperties> {
        let name = request
            .collection_name()
            .ok_or_else(|| DriverError::NotFound(request.resource_address.clone()))?;
        self.resolve_by_name(&name).await
    }

    async fn resolve_by_name(&self, collection_full_name: &str) -> DriverResult<CollectionProperties> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.by_name
            .get(collection_full_name)
            .map(|c| c.clone())
            .ok_or_else(|| DriverError::NotFound(collection_full_name.to_string()))
    }
}

// ============================================================================
// Transport
// ============================================================================

type Responder = Box<dyn Fn(&ServiceRequest, usize) -> Result<StoreResponse, StoreError> + Send + Sync>;

enum Script {
    Sequence(Mutex<VecDeque<Result<StoreResponse, StoreError>>>, Mutex<Option<Result<StoreResponse, StoreError>>>),
    Responder(Responder),
}

/// Scripted per-replica transport. Unscripted replicas reset the connection.
#[derive(Default)]
pub struct FakeTransport {
    scripts: HashMap<String, Script>,
    delays: HashMap<String, Duration>,
    barrier_delay: Option<Duration>,
    calls: DashMap<String, usize>,
    log: Mutex<Vec<(String, ServiceRequest)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies in order; the last reply repeats.
    pub fn with_sequence(mut self, replica: &ReplicaAddress, replies: Vec<Result<StoreResponse, StoreError>>) -> Self {
        let mut queue: VecDeque<_> = replies.into();
        let last = queue.back().cloned();
        if queue.len() == 1 {
            queue.clear();
        }
        self.scripts.insert(
            key(&replica.physical_uri),
            Script::Sequence(Mutex::new(queue), Mutex::new(last)),
        );
        self
    }

    pub fn with_response(self, replica: &ReplicaAddress, reply: Result<StoreResponse, StoreError>) -> Self {
        self.with_sequence(replica, vec![reply])
    }

    /// Compute the reply from the request and the zero-based call count.
    pub fn with_responder<F>(mut self, replica: &ReplicaAddress, responder: F) -> Self
    where
        F: Fn(&ServiceRequest, usize) -> Result<StoreResponse, StoreError> + Send + Sync + 'static,
    {
        self.scripts.insert(key(&replica.physical_uri), Script::Responder(Box::new(responder)));
        self
    }

    pub fn with_delay(mut self, replica: &ReplicaAddress, delay: Duration) -> Self {
        self.delays.insert(key(&replica.physical_uri), delay);
        self
    }

    /// Delay every barrier (head) request, on any replica.
    pub fn with_barrier_delay(mut self, delay: Duration) -> Self {
        self.barrier_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.iter().map(|c| *c.value()).sum()
    }

    pub fn calls_to(&self, replica: &ReplicaAddress) -> usize {
        self.calls.get(&key(&replica.physical_uri)).map_or(0, |c| *c)
    }

    /// Requests sent so far, with the replica they went to.
    pub fn requests(&self) -> Vec<(String, ServiceRequest)> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl TransportClient for FakeTransport {
    async fn invoke(
        &self,
        address: &ReplicaAddress,
        request: &ServiceRequest,
    ) -> Result<StoreResponse, StoreError> {
        let uri = key(&address.physical_uri);
        let call = {
            let mut count = self.calls.entry(uri.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        self.log.lock().push((uri.clone(), request.clone()));
        if let Some(delay) = self.delays.get(&uri) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(delay) = self.barrier_delay.filter(|_| request.operation_type == OperationType::Head) {
            tokio::time::sleep(delay).await;
        }
        match self.scripts.get(&uri) {
            Some(Script::Sequence(queue, last)) => {
                let next = queue.lock().pop_front();
                match next {
                    Some(reply) => reply,
                    None => last.lock().clone().unwrap_or_else(|| Err(StoreError::gone("exhausted"))),
                }
            },
            Some(Script::Responder(responder)) => responder(request, call),
            None => Err(StoreError::ConnectionReset { endpoint: uri, message: "unscripted".to_string() }),
        }
    }
}

/// Address resolver serving a fixed replica set.
pub struct FakeAddressResolver {
    addresses: Mutex<PartitionAddresses>,
    calls: AtomicUsize,
    forced: AtomicUsize,
}

impl FakeAddressResolver {
    pub fn new(replicas: Vec<ReplicaAddress>) -> Arc<Self> {
        Arc::new(Self {
            addresses: Mutex::new(PartitionAddresses::new(
                PartitionKeyRangeIdentity::new("rid", "0"),
                replicas,
            )),
            calls: AtomicUsize::new(0),
            forced: AtomicUsize::new(0),
        })
    }

    pub fn set_replicas(&self, replicas: Vec<ReplicaAddress>) {
        self.addresses.lock().replicas = replicas;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn forced_calls(&self) -> usize {
        self.forced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressResolver for FakeAddressResolver {
    async fn resolve(
        &self,
        request: &mut ServiceRequest,
        force_refresh: bool,
    ) -> DriverResult<PartitionAddresses> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if force_refresh {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }
        request.context.resolved_collection_rid = Some("rid".to_string());
        Ok(self.addresses.lock().clone())
    }
}
