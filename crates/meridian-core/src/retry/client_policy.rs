//! Cross-region failover for a single operation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meridian_types::{DriverConfig, FailureKind};
use tracing::{info, warn};
use url::Url;

use super::{defer_to, FailureSignal, RetryPolicy, ShouldRetryResult};
use crate::request::ServiceRequest;
use crate::routing::EndpointManager;

/// Where the next attempt should be routed.
#[derive(Debug, Clone, Copy)]
struct RetryTarget {
    location_index: usize,
    use_preferred_locations: bool,
}

/// Outermost policy of the chain. Reacts to regional failures by marking the
/// failing endpoint and routing the next attempt somewhere else.
///
/// | Failure | Action |
/// |---|---|
/// | WriteForbidden | mark write-unavailable, force topology refresh, next write region |
/// | DatabaseAccountNotFound (read) | mark read-unavailable, refresh, next read region |
/// | ReadSessionNotAvailable | next region (multi-write) or the write region once |
/// | ServiceUnavailable, network | next preferred region |
/// | Gone | next preferred region, reads and multi-write writes only |
pub struct ClientRetryPolicy {
    endpoint_manager: Arc<EndpointManager>,
    enable_endpoint_discovery: bool,
    max_failover_retries: u32,
    max_session_retries: Option<u32>,
    retry_interval: Duration,

    failover_retry_count: u32,
    session_retry_count: u32,
    unavailable_retry_count: u32,
    gone_retry_count: u32,

    is_read_request: bool,
    can_use_multiple_write_locations: bool,
    location_endpoint: Option<Url>,
    retry_target: Option<RetryTarget>,
    next: Option<Box<dyn RetryPolicy>>,
}

impl ClientRetryPolicy {
    pub fn new(endpoint_manager: Arc<EndpointManager>, config: &DriverConfig) -> Self {
        Self {
            endpoint_manager,
            enable_endpoint_discovery: config.enable_endpoint_discovery,
            max_failover_retries: config.max_client_retries,
            max_session_retries: config.max_session_retries,
            retry_interval: config.retry_interval(),
            failover_retry_count: 0,
            session_retry_count: 0,
            unavailable_retry_count: 0,
            gone_retry_count: 0,
            is_read_request: true,
            can_use_multiple_write_locations: false,
            location_endpoint: None,
            retry_target: None,
            next: None,
        }
    }

    pub fn with_next(mut self, next: Box<dyn RetryPolicy>) -> Self {
        self.next = Some(next);
        self
    }

    /// Endpoint the last attempt was routed to.
    pub fn location_endpoint(&self) -> Option<&Url> {
        self.location_endpoint.as_ref()
    }

    async fn retry_on_endpoint_failure(&mut self, is_read: bool, force_refresh: bool) -> ShouldRetryResult {
        if !self.enable_endpoint_discovery || self.failover_retry_count >= self.max_failover_retries {
            info!(
                failover_retry_count = self.failover_retry_count,
                "Endpoint failover budget exhausted"
            );
            return ShouldRetryResult::NoRetry;
        }
        self.failover_retry_count += 1;

        if let Some(endpoint) = &self.location_endpoint {
            if is_read {
                self.endpoint_manager.mark_endpoint_unavailable_for_read(endpoint);
            } else {
                self.endpoint_manager.mark_endpoint_unavailable_for_write(endpoint);
            }
        }

        // The first write failover goes out immediately; the account may
        // already have moved its write region.
        let delay = if is_read || self.failover_retry_count > 1 { self.retry_interval } else { Duration::ZERO };

        if let Err(e) = self.endpoint_manager.refresh_location(force_refresh).await {
            warn!(error = %e, "Topology refresh during failover failed");
        }

        self.retry_target = Some(RetryTarget {
            location_index: self.failover_retry_count as usize,
            use_preferred_locations: false,
        });
        ShouldRetryResult::RetryAfter(delay)
    }

    fn retry_on_session_not_available(&mut self) -> ShouldRetryResult {
        self.session_retry_count += 1;
        if !self.enable_endpoint_discovery {
            return ShouldRetryResult::NoRetry;
        }

        if self.can_use_multiple_write_locations {
            let regions = if self.is_read_request {
                self.endpoint_manager.read_endpoints().len()
            } else {
                self.endpoint_manager.write_endpoints().len()
            };
            let limit = self.max_session_retries.map_or(regions, |max| (max as usize).min(regions));
            if self.session_retry_count as usize > limit {
                return ShouldRetryResult::NoRetry;
            }
            self.retry_target = Some(RetryTarget {
                location_index: self.session_retry_count as usize,
                use_preferred_locations: true,
            });
        } else {
            if self.session_retry_count > 1 {
                return ShouldRetryResult::NoRetry;
            }
            // The write region always has the latest session.
            self.retry_target = Some(RetryTarget { location_index: 0, use_preferred_locations: false });
        }
        ShouldRetryResult::retry_now()
    }

    fn retry_on_service_unavailable(&mut self) -> ShouldRetryResult {
        if !self.is_read_request && !self.can_use_multiple_write_locations {
            return ShouldRetryResult::NoRetry;
        }
        let regions = self.endpoint_manager.preferred_location_count();
        if regions <= 1 || self.unavailable_retry_count as usize >= regions - 1 {
            return ShouldRetryResult::NoRetry;
        }
        self.unavailable_retry_count += 1;

        if let Some(endpoint) = &self.location_endpoint {
            if self.is_read_request {
                self.endpoint_manager.mark_endpoint_unavailable_for_read(endpoint);
            } else {
                self.endpoint_manager.mark_endpoint_unavailable_for_write(endpoint);
            }
        }
        // The failing endpoint moved to the back of the list.
        self.retry_target = Some(RetryTarget { location_index: 0, use_preferred_locations: true });
        ShouldRetryResult::retry_now()
    }

    fn retry_on_gone(&mut self) -> Option<ShouldRetryResult> {
        if !self.is_read_request && !self.can_use_multiple_write_locations {
            return None;
        }
        let regions = if self.is_read_request {
            self.endpoint_manager.read_endpoints().len()
        } else {
            self.endpoint_manager.write_endpoints().len()
        };
        if regions <= 1 {
            return None;
        }
        if self.gone_retry_count as usize >= regions - 1 || self.gone_retry_count >= self.max_failover_retries {
            return Some(ShouldRetryResult::NoRetry);
        }
        self.gone_retry_count += 1;
        self.retry_target = Some(RetryTarget {
            location_index: self.gone_retry_count as usize,
            use_preferred_locations: true,
        });
        Some(ShouldRetryResult::retry_now())
    }
}

#[async_trait]
impl RetryPolicy for ClientRetryPolicy {
    fn on_before_send_request(&mut self, request: &mut ServiceRequest) {
        self.is_read_request = request.is_read_only();
        self.can_use_multiple_write_locations = self.endpoint_manager.can_use_multiple_write_locations(request);

        request.context.clear_route_to_location();
        if let Some(target) = self.retry_target {
            request.context.route_to_location_index(target.location_index, target.use_preferred_locations);
        }
        self.location_endpoint = Some(self.endpoint_manager.resolve_service_endpoint(request));

        if let Some(next) = self.next.as_mut() {
            next.on_before_send_request(request);
        }
    }

    async fn should_retry(&mut self, request: &ServiceRequest, failure: &FailureSignal) -> ShouldRetryResult {
        let endpoint = self.location_endpoint.as_ref().map(ToString::to_string).unwrap_or_default();
        let decision = match failure.kind {
            FailureKind::WriteForbidden => {
                warn!(endpoint = %endpoint, "Endpoint refused writes, failing over");
                Some(self.retry_on_endpoint_failure(false, true).await)
            },
            FailureKind::DatabaseAccountNotFound if self.is_read_request => {
                warn!(endpoint = %endpoint, "Account not found in region, failing over");
                Some(self.retry_on_endpoint_failure(true, false).await)
            },
            FailureKind::ReadSessionNotAvailable => Some(self.retry_on_session_not_available()),
            FailureKind::ServiceUnavailable => {
                warn!(endpoint = %endpoint, status = ?failure.status, "Endpoint unavailable, trying next region");
                Some(self.retry_on_service_unavailable())
            },
            FailureKind::Gone => self.retry_on_gone(),
            _ => None,
        };

        match decision {
            Some(result) => {
                info!(
                    activity_id = %request.activity_id,
                    kind = ?failure.kind,
                    retry = result.is_retry(),
                    "Client retry decision"
                );
                result
            },
            None => defer_to(&mut self.next, request, failure).await,
        }
    }
}
