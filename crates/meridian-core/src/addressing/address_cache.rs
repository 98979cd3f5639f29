//! Replica address cache for one service endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use meridian_types::{
    AddressCacheConfig, PartitionAddresses, PartitionKeyRangeIdentity, Protocol, ReplicaAddress,
    ServerKey, StoreError,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::async_cache::AsyncCache;
use crate::error::{DriverError, DriverResult};
use crate::request::ServiceRequest;
use crate::transport::{AddressSource, ChannelOpener, CollectionProperties};

/// Outcome of a connection warm-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenConnectionsSummary {
    /// Identities whose addresses were resolved and cached
    pub resolved: usize,
    /// Identities that could not be resolved (missing from the fetch or fetch failed)
    pub failed_ranges: usize,
    pub channels_opened: usize,
    pub channel_failures: usize,
}

/// Caches the replica addresses of partition key range identities.
///
/// Fetches for one identity are de-duplicated. Entries with fewer replicas
/// than the target replica-set size are force-refreshed once they are older
/// than the suboptimal refresh interval.
pub struct AddressCache {
    service_endpoint: Url,
    source: Arc<dyn AddressSource>,
    opener: Option<Arc<dyn ChannelOpener>>,
    protocol: Protocol,
    config: AddressCacheConfig,
    cache: AsyncCache<PartitionKeyRangeIdentity, PartitionAddresses>,
    suboptimal_since: DashMap<PartitionKeyRangeIdentity, Instant>,
    /// server key -> identities with a replica on that server
    server_partitions: DashMap<ServerKey, HashSet<PartitionKeyRangeIdentity>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl AddressCache {
    pub fn new(
        service_endpoint: Url,
        source: Arc<dyn AddressSource>,
        protocol: Protocol,
        config: AddressCacheConfig,
    ) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            service_endpoint,
            source,
            opener: None,
            protocol,
            config,
            cache: AsyncCache::new(),
            suboptimal_since: DashMap::new(),
            server_partitions: DashMap::new(),
            shutdown_tx,
        }
    }

    pub fn with_channel_opener(mut self, opener: Arc<dyn ChannelOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn service_endpoint(&self) -> &Url {
        &self.service_endpoint
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Addresses of `identity`, or `None` when the partition no longer exists.
    ///
    /// A forced refresh only refetches the generation this request last saw.
    /// If another caller already replaced it, the newer entry is returned.
    pub async fn try_get_addresses(
        &self,
        request: &mut ServiceRequest,
        identity: &PartitionKeyRangeIdentity,
        force_refresh: bool,
    ) -> DriverResult<Option<PartitionAddresses>> {
        request.check_live()?;
        let force_refresh = force_refresh || self.is_suboptimal_expired(identity);
        let observed = request.context.address_generations.get(identity).copied();

        let resolved = tokio::select! {
            result = self.get(identity, force_refresh, observed) => result?,
            () = request.cancellation.cancelled() => return Err(DriverError::Cancelled),
        };
        Ok(resolved.map(|(generation, addresses)| {
            request.context.address_generations.insert(identity.clone(), generation);
            addresses
        }))
    }

    async fn get(
        &self,
        identity: &PartitionKeyRangeIdentity,
        force_refresh: bool,
        observed: Option<u64>,
    ) -> DriverResult<Option<(u64, PartitionAddresses)>> {
        let obsolete = if force_refresh { observed.or_else(|| self.cache.generation(identity)) } else { None };
        let fetch = {
            let source = Arc::clone(&self.source);
            let endpoint = self.service_endpoint.clone();
            let identity = identity.clone();
            move || fetch_addresses(source, endpoint, identity, force_refresh)
        };

        match self.cache.get_or_fetch(identity, force_refresh, obsolete, fetch).await {
            Ok(versioned) => {
                self.track(&versioned.value);
                Ok(Some((versioned.generation, versioned.value)))
            },
            Err(DriverError::NotFound(message)) => {
                debug!(identity = %identity, %message, "Partition not found, no addresses");
                Ok(None)
            },
            Err(DriverError::Store(StoreError::PartitionKeyRangeGone { message })) => {
                debug!(identity = %identity, %message, "Partition key range gone, no addresses");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    fn is_suboptimal_expired(&self, identity: &PartitionKeyRangeIdentity) -> bool {
        let interval = self.config.suboptimal_partition_refresh();
        let expired = self
            .suboptimal_since
            .remove_if(identity, |_, since| since.elapsed() >= interval)
            .is_some();
        if expired {
            info!(identity = %identity, "Refreshing partition with suboptimal replica count");
        }
        expired
    }

    /// Record replica-count and server-index bookkeeping for a fresh value.
    fn track(&self, addresses: &PartitionAddresses) {
        let identity = &addresses.identity;
        if addresses.len() < self.config.target_replica_set_size as usize {
            self.suboptimal_since.entry(identity.clone()).or_insert_with(Instant::now);
        } else {
            self.suboptimal_since.remove(identity);
        }

        for replica in &addresses.replicas {
            if let Some(server) = replica.server_key() {
                self.server_partitions.entry(server).or_default().insert(identity.clone());
            }
        }
    }

    /// Evict every identity with a replica on `server`. Returns how many were evicted.
    pub fn try_remove_addresses(&self, server: &ServerKey) -> usize {
        let Some((_, identities)) = self.server_partitions.remove(server) else {
            return 0;
        };
        let removed = identities.iter().filter(|identity| self.cache.remove(identity)).count();
        info!(server = %server, removed, "Evicted addresses referencing server");
        removed
    }

    /// Resolve and cache addresses for `identities`, optionally pre-opening channels.
    ///
    /// Identities are fetched in batches. Failures are counted and logged.
    pub async fn open_connections(
        &self,
        collection: &CollectionProperties,
        identities: &[PartitionKeyRangeIdentity],
        should_open_channels: bool,
    ) -> OpenConnectionsSummary {
        let mut summary = OpenConnectionsSummary::default();
        let batch_size = (self.config.open_connections_batch_size as usize).max(1);

        for batch in identities.chunks(batch_size) {
            let range_ids: Vec<String> = batch.iter().map(|i| i.partition_key_range_id.clone()).collect();
            let fetched = match self
                .source
                .get_addresses(&self.service_endpoint, &collection.rid, &range_ids, false)
                .await
            {
                Ok(addresses) => addresses,
                Err(e) => {
                    warn!(collection = %collection.full_name, ranges = batch.len(), error = %e, "Address batch fetch failed");
                    summary.failed_ranges += batch.len();
                    continue;
                },
            };

            let mut by_range: HashMap<String, Vec<ReplicaAddress>> = HashMap::new();
            for address in fetched {
                by_range.entry(address.partition_key_range_id.clone()).or_default().push(address);
            }

            for identity in batch {
                let Some(replicas) = by_range.remove(&identity.partition_key_range_id) else {
                    let err = StoreError::PartitionKeyRangeGone {
                        message: format!("range {} missing from address fetch", identity.partition_key_range_id),
                    };
                    warn!(identity = %identity, error = %err, "Skipping warm-up for range");
                    summary.failed_ranges += 1;
                    continue;
                };
                let addresses = PartitionAddresses::new(identity.clone(), replicas);
                self.cache.insert(identity.clone(), addresses.clone());
                self.track(&addresses);
                summary.resolved += 1;

                if should_open_channels {
                    self.open_channels(&addresses, &mut summary).await;
                }
            }
        }

        info!(
            collection = %collection.full_name,
            resolved = summary.resolved,
            failed_ranges = summary.failed_ranges,
            channels_opened = summary.channels_opened,
            channel_failures = summary.channel_failures,
            "Connection warm-up finished"
        );
        summary
    }

    async fn open_channels(&self, addresses: &PartitionAddresses, summary: &mut OpenConnectionsSummary) {
        let Some(opener) = &self.opener else {
            return;
        };
        let targets = addresses.for_protocol(self.protocol, true);
        let results = opener.try_open_channels(&targets).await;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => summary.channels_opened += 1,
                Err(e) => {
                    summary.channel_failures += 1;
                    warn!(endpoint = %target.physical_uri, error = %e, "Channel warm-up failed");
                },
            }
        }
    }

    /// Number of cached identities.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Periodically force-refresh partitions stuck below the target replica count.
    ///
    /// The sweep ends on [`shutdown`](Self::shutdown) or once the cache is dropped.
    pub fn start_suboptimal_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let endpoint = self.service_endpoint.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.suboptimal_partition_refresh();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        cache.sweep_suboptimal().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(endpoint = %endpoint, "Suboptimal partition sweep shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn sweep_suboptimal(&self) {
        let due: Vec<PartitionKeyRangeIdentity> =
            self.suboptimal_since.iter().map(|e| e.key().clone()).collect();
        for identity in due {
            if !self.is_suboptimal_expired(&identity) {
                continue;
            }
            if let Err(e) = self.get(&identity, true, None).await {
                warn!(identity = %identity, error = %e, "Suboptimal partition refresh failed");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for AddressCache {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn fetch_addresses(
    source: Arc<dyn AddressSource>,
    endpoint: Url,
    identity: PartitionKeyRangeIdentity,
    force_refresh: bool,
) -> DriverResult<PartitionAddresses> {
    let replicas = if identity.is_master() {
        source.get_master_addresses(&endpoint, force_refresh).await?
    } else {
        let range_ids = [identity.partition_key_range_id.clone()];
        source
            .get_addresses(&endpoint, &identity.collection_rid, &range_ids, force_refresh)
            .await?
            .into_iter()
            .filter(|a| a.partition_key_range_id == identity.partition_key_range_id)
            .collect()
    };

    if replicas.is_empty() {
        return Err(StoreError::PartitionKeyRangeGone {
            message: format!("no replicas for {identity}"),
        }
        .into());
    }
    debug!(identity = %identity, replicas = replicas.len(), force_refresh, "Fetched replica addresses");
    Ok(PartitionAddresses::new(identity, replicas))
}
