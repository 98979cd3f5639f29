//! Endpoint manager: location cache plus topology refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_types::{AccountTopology, ConfigError, DriverConfig};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use super::location_cache::LocationCache;
use super::region_names::region_key;
use crate::error::DriverResult;
use crate::request::ServiceRequest;
use crate::transport::AccountTopologySource;

/// Owns the [`LocationCache`] and keeps it in sync with the account topology.
///
/// Concurrent refreshes collapse: a caller that finds another refresh in
/// flight waits for it and then returns without fetching again.
pub struct EndpointManager {
    cache: LocationCache,
    source: Arc<dyn AccountTopologySource>,
    /// Regions tried (in order) when the default endpoint cannot serve the topology
    fallback_regions: Vec<String>,
    background_refresh_interval: Duration,
    enable_background_refresh: bool,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_generation: AtomicU64,
    last_topology: RwLock<Option<AccountTopology>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl EndpointManager {
    pub fn new(config: &DriverConfig, source: Arc<dyn AccountTopologySource>) -> Result<Arc<Self>, ConfigError> {
        let cache = LocationCache::new(config)?;
        let mut fallback_regions = config.preferred_regions.clone();
        if let Some(region) = &config.application_region {
            fallback_regions.push(region.clone());
        }
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Ok(Arc::new(Self {
            cache,
            source,
            fallback_regions,
            background_refresh_interval: config.background_refresh_interval(),
            enable_background_refresh: config.enable_background_refresh,
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
            last_topology: RwLock::new(None),
            shutdown_tx,
        }))
    }

    /// Fetch the initial topology and validate the default endpoint against it.
    pub async fn initialize(&self) -> DriverResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let topology = self.fetch_from_any_endpoint().await?;
        self.cache.validate_default_endpoint(&topology)?;
        self.apply(topology);
        Ok(())
    }

    pub fn location_cache(&self) -> &LocationCache {
        &self.cache
    }

    pub fn default_endpoint(&self) -> &Url {
        self.cache.default_endpoint()
    }

    pub fn resolve_service_endpoint(&self, request: &mut ServiceRequest) -> Url {
        self.cache.resolve_service_endpoint(request)
    }

    pub fn mark_endpoint_unavailable_for_read(&self, endpoint: &Url) {
        self.cache.mark_endpoint_unavailable_for_read(endpoint);
    }

    pub fn mark_endpoint_unavailable_for_write(&self, endpoint: &Url) {
        self.cache.mark_endpoint_unavailable_for_write(endpoint);
    }

    pub fn should_refresh_endpoints(&self) -> (bool, bool) {
        self.cache.should_refresh_endpoints()
    }

    pub fn read_endpoints(&self) -> Vec<Url> {
        self.cache.read_endpoints()
    }

    pub fn write_endpoints(&self) -> Vec<Url> {
        self.cache.write_endpoints()
    }

    pub fn can_use_multiple_write_locations(&self, request: &ServiceRequest) -> bool {
        self.cache.can_use_multiple_write_locations_for(request)
    }

    /// Number of regions the client may fail over across.
    pub fn preferred_location_count(&self) -> usize {
        self.cache.effective_preferred_locations().len().max(1)
    }

    /// Last topology applied, if any.
    pub fn last_topology(&self) -> Option<AccountTopology> {
        self.last_topology.read().clone()
    }

    /// Refresh the topology if needed (or unconditionally with `force_refresh`).
    pub async fn refresh_location(&self, force_refresh: bool) -> DriverResult<()> {
        let observed = self.refresh_generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if self.refresh_generation.load(Ordering::Acquire) != observed {
            debug!("Topology refreshed by a concurrent caller");
            return Ok(());
        }
        if !force_refresh && !self.cache.should_refresh_endpoints().0 {
            return Ok(());
        }

        let topology = self.fetch_from_any_endpoint().await?;
        self.apply(topology);
        Ok(())
    }

    /// Start the periodic background refresh task.
    ///
    /// The task holds only a weak reference and stops once the manager is dropped.
    pub fn start_background_refresh(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if !self.enable_background_refresh || !self.cache.enable_endpoint_discovery() {
            return None;
        }
        let manager = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.background_refresh_interval;

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        if let Err(e) = manager.refresh_location(true).await {
                            warn!(error = %e, "Background topology refresh failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Endpoint manager background refresh shutting down");
                        break;
                    }
                }
            }
        }))
    }

    /// Stop background work.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn apply(&self, topology: AccountTopology) {
        self.cache.on_topology_read(&topology);
        *self.last_topology.write() = Some(topology);
        let generation = self.refresh_generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            generation,
            read_endpoints = ?self.cache.read_endpoints().iter().map(Url::as_str).collect::<Vec<_>>(),
            write_endpoints = ?self.cache.write_endpoints().iter().map(Url::as_str).collect::<Vec<_>>(),
            "Account topology applied"
        );
    }

    /// Try the default endpoint, then each fallback region's derived endpoint.
    /// The first success wins; if all fail, the first error is returned.
    async fn fetch_from_any_endpoint(&self) -> DriverResult<AccountTopology> {
        let default_endpoint = self.cache.default_endpoint().clone();
        let first_error = match self.source.get_account_topology(&default_endpoint).await {
            Ok(topology) => return Ok(topology),
            Err(e) => e,
        };
        warn!(endpoint = %default_endpoint, error = %first_error, "Topology fetch from default endpoint failed");

        if !self.cache.enable_endpoint_discovery() {
            return Err(first_error);
        }
        for region in &self.fallback_regions {
            let Some(endpoint) = derive_regional_endpoint(&default_endpoint, region) else {
                continue;
            };
            match self.source.get_account_topology(&endpoint).await {
                Ok(topology) => {
                    info!(endpoint = %endpoint, region = %region, "Topology fetched from regional endpoint");
                    return Ok(topology);
                },
                Err(e) => {
                    warn!(endpoint = %endpoint, region = %region, error = %e, "Regional topology fetch failed");
                },
            }
        }
        Err(first_error)
    }
}

impl Drop for EndpointManager {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Regional endpoint for `region`: `{account}-{region}.{rest}`.
pub fn derive_regional_endpoint(default_endpoint: &Url, region: &str) -> Option<Url> {
    let host = default_endpoint.host_str()?;
    let (account, rest) = host.split_once('.')?;
    let mut endpoint = default_endpoint.clone();
    endpoint.set_host(Some(&format!("{account}-{}.{rest}", region_key(region)))).ok()?;
    Some(endpoint)
}
