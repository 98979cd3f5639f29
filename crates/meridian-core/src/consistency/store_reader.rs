//! Parallel replica reads.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use meridian_types::models::{headers, sub_status_codes};
use meridian_types::{ReplicaAddress, StoreError, StoreResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::store_result::StoreResult;
use crate::addressing::{enumerate_replicas, AddressSelector};
use crate::error::{DriverError, DriverResult};
use crate::request::ServiceRequest;
use crate::session::{parse_partitioned_tokens, resolve_for_range, SessionContainer, SessionToken};
use crate::transport::TransportClient;

/// How a multi-replica read is performed.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaReadOptions {
    pub include_primary: bool,
    pub replica_count_to_read: usize,
    pub requires_valid_lsn: bool,
    pub use_session_token: bool,
    /// Only accept replicas that satisfy the request's session token
    pub check_min_lsn: bool,
    /// Contact every replica instead of stopping at the count
    pub force_read_all: bool,
}

impl ReplicaReadOptions {
    /// Quorum-style read: valid LSNs required, no session token.
    pub fn quorum(replica_count_to_read: usize) -> Self {
        Self {
            include_primary: false,
            replica_count_to_read,
            requires_valid_lsn: true,
            use_session_token: false,
            check_min_lsn: false,
            force_read_all: false,
        }
    }
}

struct ReadReplicaOutcome {
    results: Vec<StoreResult>,
    retry_with_force_refresh: bool,
}

/// Sends a request to one or more replicas of the resolved partition.
pub struct StoreReader {
    transport: Arc<dyn TransportClient>,
    selector: Arc<AddressSelector>,
    session: Arc<SessionContainer>,
}

impl StoreReader {
    pub fn new(
        transport: Arc<dyn TransportClient>,
        selector: Arc<AddressSelector>,
        session: Arc<SessionContainer>,
    ) -> Self {
        Self { transport, selector, session }
    }

    pub fn selector(&self) -> &Arc<AddressSelector> {
        &self.selector
    }

    /// Read up to `replica_count_to_read` valid results.
    ///
    /// Retries once with a forced address refresh when too few replicas
    /// resolved or a Gone came back. The caller's session header is restored.
    pub async fn read_multiple_replicas(
        &self,
        request: &mut ServiceRequest,
        options: ReplicaReadOptions,
    ) -> DriverResult<Vec<StoreResult>> {
        ensure_time_left(request)?;
        let original_session = request.headers.get(headers::SESSION_TOKEN).cloned();

        let mut outcome = self.read_multiple_internal(request, options).await;
        if matches!(&outcome, Ok(o) if o.retry_with_force_refresh) && !request.context.force_refresh_address_cache {
            ensure_time_left(request)?;
            debug!(activity_id = %request.activity_id, "Retrying replica read with refreshed addresses");
            request.context.force_refresh_address_cache = true;
            outcome = self
                .read_multiple_internal(request, ReplicaReadOptions { check_min_lsn: false, ..options })
                .await;
        }

        restore_session_header(request, original_session);
        outcome.map(|o| o.results)
    }

    /// Read the primary replica.
    pub async fn read_primary(
        &self,
        request: &mut ServiceRequest,
        requires_valid_lsn: bool,
        use_session_token: bool,
    ) -> DriverResult<StoreResult> {
        ensure_time_left(request)?;
        let original_session = request.headers.get(headers::SESSION_TOKEN).cloned();

        let mut outcome = self.read_primary_internal(request, requires_valid_lsn, use_session_token, false).await;
        if matches!(&outcome, Ok(o) if o.retry_with_force_refresh) && !request.context.force_refresh_address_cache {
            request.context.force_refresh_address_cache = true;
            outcome = self.read_primary_internal(request, requires_valid_lsn, use_session_token, true).await;
        }

        restore_session_header(request, original_session);
        outcome?.results.into_iter().next().ok_or_else(|| {
            StoreError::Gone {
                sub_status: sub_status_codes::NO_VALID_STORE_RESPONSE,
                message: "no valid response from primary".to_string(),
            }
            .into()
        })
    }

    async fn read_multiple_internal(
        &self,
        request: &mut ServiceRequest,
        options: ReplicaReadOptions,
    ) -> DriverResult<ReadReplicaOutcome> {
        ensure_time_left(request)?;
        let force_refresh = request.context.force_refresh_address_cache;
        let replicas = self.selector.resolve_all_addresses(request, options.include_primary, force_refresh).await?;

        let required_session = if options.use_session_token {
            self.set_partition_local_session_token(request);
            options.check_min_lsn.then(|| request.context.session_token.clone()).flatten()
        } else {
            request.headers.remove(headers::SESSION_TOKEN);
            None
        };

        let count = options.replica_count_to_read;
        if replicas.len() < count {
            debug!(resolved = replicas.len(), required = count, "Too few replicas resolved");
            return Ok(ReadReplicaOutcome { results: Vec::new(), retry_with_force_refresh: !force_refresh });
        }

        let mut pending_replicas = enumerate_replicas(&replicas, &request.context.failed_endpoints).into_iter();
        let mut results: Vec<StoreResult> = Vec::with_capacity(count);
        let mut has_gone = false;

        while results.len() < count {
            ensure_time_left(request)?;
            let wanted = count - results.len();
            let wave: Vec<ReplicaAddress> = if options.force_read_all {
                pending_replicas.by_ref().collect()
            } else {
                pending_replicas.by_ref().take(wanted).collect()
            };
            if wave.is_empty() {
                break;
            }

            let replies = self.fan_out(request, &wave, (!options.force_read_all).then_some(wanted)).await?;
            for (address, reply) in replies {
                if reply.is_err() {
                    request.context.add_failed_endpoint(address.physical_uri.clone());
                }
                let result = StoreResult::from_reply(reply, &address.physical_uri, options.requires_valid_lsn);
                if let Some(error) = result.error.as_ref().filter(|e| e.aborts_replica_fan_out()) {
                    return Err(error.clone().into());
                }
                has_gone |= result.is_gone_requiring_refresh();
                if result.is_valid && satisfies_session(required_session.as_ref(), &result) {
                    results.push(result);
                }
            }

            if has_gone && !request.context.performed_background_address_refresh {
                self.start_background_address_refresh(request);
                request.context.performed_background_address_refresh = true;
            }
        }

        if results.len() < count {
            info!(
                valid = results.len(),
                required = count,
                resolved = replicas.len(),
                has_gone,
                "Could not collect enough valid replica responses"
            );
            if has_gone && !request.context.force_refresh_address_cache {
                return Ok(ReadReplicaOutcome { results, retry_with_force_refresh: true });
            }
        }
        Ok(ReadReplicaOutcome { results, retry_with_force_refresh: false })
    }

    /// Call every replica in `wave` concurrently.
    ///
    /// With `stop_after`, collection ends once that many successful replies
    /// arrived; the rest are dropped.
    async fn fan_out<'a>(
        &self,
        request: &ServiceRequest,
        wave: &'a [ReplicaAddress],
        stop_after: Option<usize>,
    ) -> DriverResult<Vec<(&'a ReplicaAddress, Result<StoreResponse, StoreError>)>> {
        let mut pending: FuturesUnordered<_> = wave
            .iter()
            .map(|address| async move { (address, self.transport.invoke(address, request).await) })
            .collect();

        let mut replies = Vec::with_capacity(wave.len());
        let mut successes = 0;
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((address, reply)) => {
                        if matches!(&reply, Ok(r) if !r.is_error()) {
                            successes += 1;
                        }
                        replies.push((address, reply));
                        if stop_after.is_some_and(|n| successes >= n) {
                            break;
                        }
                    },
                    None => break,
                },
                () = request.cancellation.cancelled() => return Err(DriverError::Cancelled),
                () = request.deadline_elapsed() => return Err(deadline_exceeded()),
            }
        }
        Ok(replies)
    }

    async fn read_primary_internal(
        &self,
        request: &mut ServiceRequest,
        requires_valid_lsn: bool,
        use_session_token: bool,
        is_retry_after_refresh: bool,
    ) -> DriverResult<ReadReplicaOutcome> {
        ensure_time_left(request)?;
        let force_refresh = request.context.force_refresh_address_cache;
        let primary = self.selector.resolve_primary(request, force_refresh).await?;

        if use_session_token {
            self.set_partition_local_session_token(request);
        } else {
            request.headers.remove(headers::SESSION_TOKEN);
        }

        let reply = tokio::select! {
            reply = self.transport.invoke(&primary, request) => reply,
            () = request.cancellation.cancelled() => return Err(DriverError::Cancelled),
            () = request.deadline_elapsed() => return Err(deadline_exceeded()),
        };
        if reply.is_err() {
            request.context.add_failed_endpoint(primary.physical_uri.clone());
        }
        let result = StoreResult::from_reply(reply, &primary.physical_uri, requires_valid_lsn);
        if let Some(error) = result.error.as_ref().filter(|e| e.aborts_replica_fan_out()) {
            return Err(error.clone().into());
        }

        if result.is_gone_requiring_refresh() {
            if is_retry_after_refresh || request.context.force_refresh_address_cache {
                return Err(StoreError::Gone {
                    sub_status: result.sub_status(),
                    message: format!("primary {} is gone", primary.physical_uri),
                }
                .into());
            }
            return Ok(ReadReplicaOutcome { results: Vec::new(), retry_with_force_refresh: true });
        }
        Ok(ReadReplicaOutcome { results: vec![result], retry_with_force_refresh: false })
    }

    /// Replace the request's session header with the partition-local token.
    ///
    /// A caller-supplied collection token is narrowed to the target range;
    /// otherwise the container's token for the range (or its parents) is used.
    pub fn set_partition_local_session_token(&self, request: &mut ServiceRequest) {
        let Some(range) = request.context.resolved_partition_key_range.clone() else {
            request.headers.remove(headers::SESSION_TOKEN);
            request.context.session_token = None;
            return;
        };

        let token = match request.session_token_header().filter(|h| !h.trim().is_empty()) {
            Some(header) => resolve_for_range(&parse_partitioned_tokens(header), &range.id, &range.parents),
            None => self.session.resolve_partition_local_session_token(request, &range.id),
        };
        match &token {
            Some(token) => {
                request.headers.insert(headers::SESSION_TOKEN.to_string(), format!("{}:{token}", range.id));
            },
            None => {
                request.headers.remove(headers::SESSION_TOKEN);
            },
        }
        request.context.session_token = token;
    }

    fn start_background_address_refresh(&self, request: &ServiceRequest) {
        let selector = Arc::clone(&self.selector);
        let mut refresh = request.clone();
        refresh.cancellation = CancellationToken::new();
        refresh.context.force_refresh_address_cache = true;
        tokio::spawn(async move {
            if let Err(e) = selector.resolve_addresses(&mut refresh, true).await {
                debug!(error = %e, "Background address refresh failed");
            }
        });
    }
}

fn satisfies_session(required: Option<&SessionToken>, result: &StoreResult) -> bool {
    required.is_none_or(|required| {
        result.session_token.as_ref().is_some_and(|token| required.is_satisfied_by(token))
    })
}

fn restore_session_header(request: &mut ServiceRequest, original: Option<String>) {
    match original {
        Some(token) => {
            request.headers.insert(headers::SESSION_TOKEN.to_string(), token);
        },
        None => {
            request.headers.remove(headers::SESSION_TOKEN);
        },
    }
}

/// Fail with Gone once the request deadline has passed.
pub(crate) fn ensure_time_left(request: &ServiceRequest) -> DriverResult<()> {
    request.check_live()?;
    if request.is_past_deadline() {
        return Err(deadline_exceeded());
    }
    Ok(())
}

pub(crate) fn deadline_exceeded() -> DriverError {
    StoreError::gone("request deadline elapsed").into()
}

/// Whether `error` came from running out of time rather than from a replica.
pub(crate) fn failed_on_deadline(request: &ServiceRequest, error: &DriverError) -> bool {
    request.is_past_deadline() && !error.is_cancelled()
}
