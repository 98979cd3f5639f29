//! Ordered regional endpoints and advisory unavailability.
//!
//! The cache keeps an immutable [`LocationInfo`] snapshot behind a lock and
//! swaps in a rebuilt one whenever the topology, the preference list, or the
//! unavailability set changes. Readers clone the `Arc` and never block a rebuild.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use meridian_types::{AccountRegion, AccountTopology, ConfigError, DriverConfig};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::region_names::{canonical_region_name, normalize_region_name, region_key, same_region};
use crate::request::ServiceRequest;


/// Operation class an endpoint can be unavailable for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct UnavailabilityInfo {
    last_marked: Instant,
    read: bool,
    write: bool,
}

impl UnavailabilityInfo {
    fn covers(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Read => self.read,
            OperationKind::Write => self.write,
        }
    }
}

/// Immutable routing snapshot.
#[derive(Debug, Clone)]
pub struct LocationInfo {
    /// Caller preference, normalized; empty when none was supplied
    pub preferred_locations: Vec<String>,
    /// Preference actually used for ordering
    pub effective_preferred_locations: Vec<String>,
    pub available_write_locations: Vec<String>,
    pub available_read_locations: Vec<String>,
    write_endpoint_by_location: HashMap<String, Url>,
    read_endpoint_by_location: HashMap<String, Url>,
    pub write_endpoints: Vec<Url>,
    pub read_endpoints: Vec<Url>,
    pub account_read_endpoints: Vec<Url>,
}

impl LocationInfo {
    fn new(preferred_locations: Vec<String>, default_endpoint: &Url) -> Self {
        Self {
            effective_preferred_locations: preferred_locations.clone(),
            preferred_locations,
            available_write_locations: Vec::new(),
            available_read_locations: Vec::new(),
            write_endpoint_by_location: HashMap::new(),
            read_endpoint_by_location: HashMap::new(),
            write_endpoints: vec![default_endpoint.clone()],
            read_endpoints: vec![default_endpoint.clone()],
            account_read_endpoints: vec![default_endpoint.clone()],
        }
    }

    pub fn write_endpoint_for(&self, location: &str) -> Option<&Url> {
        self.write_endpoint_by_location.get(&region_key(location))
    }

    pub fn read_endpoint_for(&self, location: &str) -> Option<&Url> {
        self.read_endpoint_by_location.get(&region_key(location))
    }
}

/// Resolves which regional endpoint a request goes to.
pub struct LocationCache {
    default_endpoint: Url,
    enable_endpoint_discovery: bool,
    use_multiple_write_locations: bool,
    application_region: Option<String>,
    unavailable_ttl: Duration,
    enable_multiple_write_locations: AtomicBool,
    info: RwLock<Arc<LocationInfo>>,
    last_update: Mutex<Instant>,
    /// Serializes snapshot rebuilds
    update_lock: Mutex<()>,
    unavailability: DashMap<Url, UnavailabilityInfo>,
}

impl LocationCache {
    /// Build from configuration, rejecting invalid region options up front.
    pub fn new(config: &DriverConfig) -> Result<Self, ConfigError> {
        let default_endpoint = Url::parse(&config.default_endpoint).map_err(|e| {
            ConfigError::InvalidEndpoint { endpoint: config.default_endpoint.clone(), message: e.to_string() }
        })?;
        config.check()?;
        let application_region = match &config.application_region {
            Some(region) => Some(
                canonical_region_name(region)
                    .ok_or_else(|| ConfigError::InvalidRegion { region: region.clone() })?
                    .to_string(),
            ),
            None => None,
        };
        let preferred: Vec<String> =
            config.preferred_regions.iter().map(|r| normalize_region_name(r)).collect();

        Ok(Self {
            info: RwLock::new(Arc::new(LocationInfo::new(preferred, &default_endpoint))),
            default_endpoint,
            enable_endpoint_discovery: config.enable_endpoint_discovery,
            use_multiple_write_locations: config.use_multiple_write_locations,
            application_region,
            unavailable_ttl: config.unavailable_endpoint_ttl(),
            enable_multiple_write_locations: AtomicBool::new(false),
            last_update: Mutex::new(Instant::now()),
            update_lock: Mutex::new(()),
            unavailability: DashMap::new(),
        })
    }

    pub fn default_endpoint(&self) -> &Url {
        &self.default_endpoint
    }

    pub fn enable_endpoint_discovery(&self) -> bool {
        self.enable_endpoint_discovery
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<LocationInfo> {
        Arc::clone(&self.info.read())
    }

    /// Read endpoints ordered by preference, then availability.
    pub fn read_endpoints(&self) -> Vec<Url> {
        self.refresh_if_stale();
        self.snapshot().read_endpoints.clone()
    }

    /// Write endpoints ordered by preference (multi-write) or account order.
    pub fn write_endpoints(&self) -> Vec<Url> {
        self.refresh_if_stale();
        self.snapshot().write_endpoints.clone()
    }

    pub fn account_read_endpoints(&self) -> Vec<Url> {
        self.snapshot().account_read_endpoints.clone()
    }

    pub fn effective_preferred_locations(&self) -> Vec<String> {
        self.snapshot().effective_preferred_locations.clone()
    }

    pub fn available_read_locations(&self) -> Vec<String> {
        self.snapshot().available_read_locations.clone()
    }

    pub fn available_write_locations(&self) -> Vec<String> {
        self.snapshot().available_write_locations.clone()
    }

    /// Client opt-in and server switch are both on.
    pub fn can_use_multiple_write_locations(&self) -> bool {
        self.use_multiple_write_locations && self.enable_multiple_write_locations.load(Ordering::Acquire)
    }

    /// Multi-write applies to this request's resource kind.
    pub fn can_use_multiple_write_locations_for(&self, request: &ServiceRequest) -> bool {
        self.can_use_multiple_write_locations()
            && request.resource_type.supports_multi_region_writes(request.operation_type)
    }

    /// Pick the endpoint for `request` and pin it on the request context.
    pub fn resolve_service_endpoint(&self, request: &mut ServiceRequest) -> Url {
        if let Some(endpoint) = &request.context.location_endpoint_to_route {
            return endpoint.clone();
        }

        let location_index = request.context.location_index_to_route;
        let mut endpoint = self.default_endpoint.clone();

        if !request.context.use_preferred_locations
            || (request.operation_type.is_write() && !self.can_use_multiple_write_locations_for(request))
        {
            // Flip-flop between the first two account write regions (manual failover).
            let info = self.snapshot();
            if self.enable_endpoint_discovery && !info.available_write_locations.is_empty() {
                let index = (location_index % 2).min(info.available_write_locations.len() - 1);
                let location = &info.available_write_locations[index];
                if let Some(write_endpoint) = info.write_endpoint_for(location) {
                    endpoint = write_endpoint.clone();
                }
            }
        } else {
            let endpoints = self.applicable_endpoints(request, request.is_read_only());
            endpoint = endpoints[location_index % endpoints.len()].clone();
        }

        debug!(
            endpoint = %endpoint,
            operation = ?request.operation_type,
            location_index,
            "Resolved service endpoint"
        );
        request.context.route_to_location(endpoint.clone());
        endpoint
    }

    /// Ordered endpoints for a request, honoring its excluded regions.
    pub fn applicable_endpoints(&self, request: &ServiceRequest, is_read: bool) -> Vec<Url> {
        let endpoints = if is_read { self.read_endpoints() } else { self.write_endpoints() };
        if request.context.exclude_regions.is_empty() {
            return endpoints;
        }

        let info = self.snapshot();
        let mut applicable: Vec<Url> = info
            .effective_preferred_locations
            .iter()
            .filter(|region| !request.context.exclude_regions.iter().any(|ex| same_region(ex, region)))
            .filter_map(|region| {
                if is_read { info.read_endpoint_for(region) } else { info.write_endpoint_for(region) }
            })
            .cloned()
            .collect();
        if applicable.is_empty() {
            applicable.push(self.default_endpoint.clone());
        }
        applicable
    }

    pub fn mark_endpoint_unavailable_for_read(&self, endpoint: &Url) {
        self.mark_endpoint_unavailable(endpoint, OperationKind::Read);
    }

    pub fn mark_endpoint_unavailable_for_write(&self, endpoint: &Url) {
        self.mark_endpoint_unavailable(endpoint, OperationKind::Write);
    }

    /// Apply a freshly read account topology.
    pub fn on_topology_read(&self, topology: &AccountTopology) {
        self.update(
            Some(&topology.writable_locations),
            Some(&topology.readable_locations),
            Some(topology.enable_multiple_write_locations),
        );
    }

    /// Check the default endpoint against the account topology.
    ///
    /// A default endpoint named like a regional endpoint must match one of the
    /// account's regions.
    pub fn validate_default_endpoint(&self, topology: &AccountTopology) -> Result<(), ConfigError> {
        if !self.enable_endpoint_discovery || regional_suffix(&self.default_endpoint).is_none() {
            return Ok(());
        }
        if region_for_endpoint(topology, &self.default_endpoint).is_some() {
            return Ok(());
        }
        Err(ConfigError::UnresolvedRegionalEndpoint { endpoint: self.default_endpoint.to_string() })
    }

    /// Whether the topology should be refetched, and whether that can happen
    /// in the background (another endpoint is still usable meanwhile).
    pub fn should_refresh_endpoints(&self) -> (bool, bool) {
        if !self.enable_endpoint_discovery {
            return (false, true);
        }
        let info = self.snapshot();
        let most_preferred = info.effective_preferred_locations.first();
        let should_refresh = self.use_multiple_write_locations
            && !self.enable_multiple_write_locations.load(Ordering::Acquire);

        let read_head = &info.read_endpoints[0];
        if self.is_endpoint_unavailable(read_head, OperationKind::Read) {
            let can_refresh_in_background = info.read_endpoints.len() > 1;
            debug!(endpoint = %read_head, can_refresh_in_background, "First read endpoint unavailable");
            return (true, can_refresh_in_background);
        }

        if let Some(location) = most_preferred {
            match info.read_endpoint_for(location) {
                Some(endpoint) if endpoint != read_head => {
                    debug!(location = %location, "Most preferred location is not first for reads");
                    return (true, true);
                },
                Some(_) => {},
                None => {
                    debug!(location = %location, "Most preferred location missing from read locations");
                    return (true, true);
                },
            }
        }

        let write_head = &info.write_endpoints[0];
        if !self.can_use_multiple_write_locations() {
            if self.is_endpoint_unavailable(write_head, OperationKind::Write) {
                let can_refresh_in_background = info.write_endpoints.len() > 1;
                debug!(endpoint = %write_head, can_refresh_in_background, "First write endpoint unavailable");
                return (true, can_refresh_in_background);
            }
            return (should_refresh, true);
        }

        match most_preferred {
            Some(location) => match info.write_endpoint_for(location) {
                Some(endpoint) if self.is_endpoint_unavailable(endpoint, OperationKind::Write) => {
                    let can_refresh_in_background = info.available_write_locations.iter().any(|other| {
                        info.write_endpoint_for(other)
                            .is_some_and(|e| e != endpoint && !self.is_endpoint_unavailable(e, OperationKind::Write))
                    });
                    debug!(endpoint = %endpoint, can_refresh_in_background, "Most preferred write endpoint unavailable");
                    (true, can_refresh_in_background)
                },
                Some(endpoint) => (should_refresh || endpoint != write_head, true),
                None => (true, true),
            },
            None => (should_refresh, true),
        }
    }

    /// Check if `endpoint` has an unexpired mark covering `kind`.
    pub fn is_endpoint_unavailable(&self, endpoint: &Url, kind: OperationKind) -> bool {
        self.unavailability
            .get(endpoint)
            .is_some_and(|entry| entry.covers(kind) && entry.last_marked.elapsed() <= self.unavailable_ttl)
    }

    fn mark_endpoint_unavailable(&self, endpoint: &Url, kind: OperationKind) {
        let now = Instant::now();
        self.unavailability
            .entry(endpoint.clone())
            .and_modify(|entry| {
                entry.last_marked = now;
                match kind {
                    OperationKind::Read => entry.read = true,
                    OperationKind::Write => entry.write = true,
                }
            })
            .or_insert(UnavailabilityInfo {
                last_marked: now,
                read: kind == OperationKind::Read,
                write: kind == OperationKind::Write,
            });
        warn!(endpoint = %endpoint, operation = ?kind, "Marked endpoint unavailable");
        self.update(None, None, None);
    }

    fn refresh_if_stale(&self) {
        if self.unavailability.is_empty() {
            return;
        }
        if self.last_update.lock().elapsed() > self.unavailable_ttl {
            self.update(None, None, None);
        }
    }

    fn clear_stale_unavailability(&self) {
        let ttl = self.unavailable_ttl;
        self.unavailability.retain(|endpoint, entry| {
            let keep = entry.last_marked.elapsed() <= ttl;
            if !keep {
                info!(endpoint = %endpoint, "Endpoint unavailability expired");
            }
            keep
        });
    }

    fn update(
        &self,
        write_locations: Option<&[AccountRegion]>,
        read_locations: Option<&[AccountRegion]>,
        enable_multiple_write_locations: Option<bool>,
    ) {
        let _guard = self.update_lock.lock();
        let mut next = LocationInfo::clone(&self.snapshot());

        if let Some(enabled) = enable_multiple_write_locations {
            self.enable_multiple_write_locations.store(enabled, Ordering::Release);
        }

        self.clear_stale_unavailability();

        if let Some(read_locations) = read_locations {
            let (by_location, ordered) = endpoints_by_location(read_locations);
            next.account_read_endpoints =
                ordered.iter().filter_map(|n| by_location.get(&region_key(n)).cloned()).collect();
            next.read_endpoint_by_location = by_location;
            next.available_read_locations = ordered;
        }
        if let Some(write_locations) = write_locations {
            let (by_location, ordered) = endpoints_by_location(write_locations);
            next.write_endpoint_by_location = by_location;
            next.available_write_locations = ordered;
        }

        next.effective_preferred_locations = self.effective_preferred(&next);

        next.write_endpoints = self.preferred_available_endpoints(
            &next,
            &next.write_endpoint_by_location,
            &next.available_write_locations,
            OperationKind::Write,
            &self.default_endpoint,
        );
        let read_fallback = next.write_endpoints[0].clone();
        next.read_endpoints = self.preferred_available_endpoints(
            &next,
            &next.read_endpoint_by_location,
            &next.available_read_locations,
            OperationKind::Read,
            &read_fallback,
        );

        debug!(
            write_endpoints = ?next.write_endpoints.iter().map(Url::as_str).collect::<Vec<_>>(),
            read_endpoints = ?next.read_endpoints.iter().map(Url::as_str).collect::<Vec<_>>(),
            "Location cache updated"
        );
        *self.last_update.lock() = Instant::now();
        *self.info.write() = Arc::new(next);
    }

    /// Preference used for ordering when the caller supplied none.
    ///
    /// An application region leads, followed by the rest of the account's read
    /// regions. A regional default endpoint pins routing to its own region.
    /// Otherwise the account read order stands in.
    fn effective_preferred(&self, info: &LocationInfo) -> Vec<String> {
        if !info.preferred_locations.is_empty() {
            return info.preferred_locations.clone();
        }
        if let Some(application_region) = &self.application_region {
            let mut regions = vec![application_region.clone()];
            regions.extend(
                info.available_read_locations
                    .iter()
                    .filter(|r| !same_region(r, application_region))
                    .cloned(),
            );
            return regions;
        }
        let regional = info
            .available_read_locations
            .iter()
            .find(|name| info.read_endpoint_for(name).is_some_and(|u| u.host_str() == self.default_endpoint.host_str()))
            .or_else(|| {
                info.available_write_locations.iter().find(|name| {
                    info.write_endpoint_for(name).is_some_and(|u| u.host_str() == self.default_endpoint.host_str())
                })
            });
        if let Some(region) = regional {
            return vec![region.clone()];
        }
        info.available_read_locations.clone()
    }

    fn preferred_available_endpoints(
        &self,
        info: &LocationInfo,
        endpoint_by_location: &HashMap<String, Url>,
        ordered_locations: &[String],
        kind: OperationKind,
        fallback: &Url,
    ) -> Vec<Url> {
        let mut endpoints: Vec<Url> = Vec::new();

        if self.enable_endpoint_discovery {
            if self.can_use_multiple_write_locations() || kind == OperationKind::Read {
                let mut unavailable: Vec<Url> = Vec::new();
                for location in &info.effective_preferred_locations {
                    if let Some(endpoint) = endpoint_by_location.get(&region_key(location)) {
                        if self.is_endpoint_unavailable(endpoint, kind) {
                            unavailable.push(endpoint.clone());
                        } else {
                            endpoints.push(endpoint.clone());
                        }
                    }
                }
                if endpoints.is_empty() {
                    endpoints.push(fallback.clone());
                    unavailable.retain(|u| u != fallback);
                }
                endpoints.extend(unavailable);
            } else {
                endpoints.extend(
                    ordered_locations
                        .iter()
                        .filter(|l| !l.is_empty())
                        .filter_map(|l| endpoint_by_location.get(&region_key(l)).cloned()),
                );
            }
        }

        if endpoints.is_empty() {
            endpoints.push(fallback.clone());
        }
        endpoints
    }
}

/// Parse account regions, skipping entries with an empty name or bad endpoint.
fn endpoints_by_location(locations: &[AccountRegion]) -> (HashMap<String, Url>, Vec<String>) {
    let mut by_location = HashMap::new();
    let mut ordered = Vec::new();
    for location in locations {
        match Url::parse(&location.endpoint) {
            Ok(endpoint) if !location.name.is_empty() => {
                by_location.insert(region_key(&location.name), endpoint);
                ordered.push(location.name.clone());
            },
            _ => {
                info!(
                    location = %location.name,
                    endpoint = %location.endpoint,
                    "Skipping location with empty name or malformed endpoint"
                );
            },
        }
    }
    (by_location, ordered)
}

/// Region suffix of an endpoint host named `{account}-{region}.{rest}`.
pub(crate) fn regional_suffix(endpoint: &Url) -> Option<&'static str> {
    let host = endpoint.host_str()?;
    let first_label = host.split('.').next()?;
    let (_, suffix) = first_label.rsplit_once('-')?;
    canonical_region_name(suffix)
}

fn region_for_endpoint(topology: &AccountTopology, endpoint: &Url) -> Option<String> {
    topology
        .readable_locations
        .iter()
        .chain(topology.writable_locations.iter())
        .find(|region| {
            Url::parse(&region.endpoint).is_ok_and(|u| u.host_str() == endpoint.host_str())
        })
        .map(|region| region.name.clone())
}
