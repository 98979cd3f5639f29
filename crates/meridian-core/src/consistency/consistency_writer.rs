//! Primary writes and the global-strong write barrier.

use std::sync::Arc;

use meridian_types::models::{headers, status_codes, sub_status_codes};
use meridian_types::{ConsistencyLevel, GlobalStrongWritePolicy, QuorumConfig, StoreError, StoreResponse};
use tracing::{debug, warn};

use super::quorum_reader::barrier_request;
use super::store_reader::{deadline_exceeded, ensure_time_left, failed_on_deadline, ReplicaReadOptions, StoreReader};
use crate::error::{DriverError, DriverResult};
use crate::request::ServiceRequest;
use crate::session::SessionContainer;
use crate::transport::TransportClient;

/// Sends writes to the primary replica.
///
/// On a strong account with read regions, a write is only acknowledged once
/// some replica reports a global committed LSN at or past the write's LSN.
pub struct ConsistencyWriter {
    transport: Arc<dyn TransportClient>,
    store_reader: Arc<StoreReader>,
    session: Arc<SessionContainer>,
    config: QuorumConfig,
    account_strong: bool,
}

impl ConsistencyWriter {
    pub fn new(
        transport: Arc<dyn TransportClient>,
        store_reader: Arc<StoreReader>,
        session: Arc<SessionContainer>,
        config: QuorumConfig,
        account_consistency: ConsistencyLevel,
    ) -> Self {
        Self {
            transport,
            store_reader,
            session,
            config,
            account_strong: account_consistency == ConsistencyLevel::Strong,
        }
    }

    pub async fn write(&self, request: &mut ServiceRequest) -> DriverResult<StoreResponse> {
        ensure_time_left(request)?;
        request.headers.remove(headers::SESSION_TOKEN);
        request.context.global_committed_selected_lsn = -1;

        let force_refresh = request.context.force_refresh_address_cache;
        let primary = self.store_reader.selector().resolve_primary(request, force_refresh).await?;

        let reply = tokio::select! {
            reply = self.transport.invoke(&primary, request) => reply,
            () = request.cancellation.cancelled() => return Err(DriverError::Cancelled),
            () = request.deadline_elapsed() => return Err(deadline_exceeded()),
        };
        let response = match reply {
            Ok(response) => response,
            Err(error) => {
                request.context.add_failed_endpoint(primary.physical_uri.clone());
                return Err(error.into());
            },
        };
        self.session.record_response(request, &response);

        if !self.requires_write_barrier(&response) {
            return Ok(response);
        }
        if response.lsn == -1 || response.global_committed_lsn == -1 {
            return Err(StoreError::gone(format!(
                "write to {} returned lsn {} global committed lsn {}",
                primary.physical_uri, response.lsn, response.global_committed_lsn
            ))
            .into());
        }

        request.context.global_committed_selected_lsn = response.lsn;
        let (converged, last_gclsn) = self.wait_for_write_barrier(request, response.lsn).await?;
        if converged {
            return Ok(response);
        }

        match self.config.global_strong_write_policy {
            GlobalStrongWritePolicy::Fail => Err(StoreError::GlobalStrongWriteBarrierNotMet {
                lsn: response.lsn,
                global_committed_lsn: last_gclsn,
            }
            .into()),
            GlobalStrongWritePolicy::AcceptLocalCommit => {
                warn!(
                    activity_id = %request.activity_id,
                    lsn = response.lsn,
                    global_committed_lsn = last_gclsn,
                    "Write barrier did not converge, returning locally committed write"
                );
                Ok(response)
            },
        }
    }

    fn requires_write_barrier(&self, response: &StoreResponse) -> bool {
        let status_applies = response.status < status_codes::BAD_REQUEST
            || response.status == status_codes::CONFLICT
            || response.status == status_codes::PRECONDITION_FAILED
            || (response.status == status_codes::NOT_FOUND
                && response.sub_status != sub_status_codes::READ_SESSION_NOT_AVAILABLE);
        status_applies && self.account_strong && response.number_of_read_regions > 0
    }

    /// Poll until a replica reports `target_gclsn` as globally committed.
    ///
    /// Returns whether it converged and the highest global committed LSN seen.
    async fn wait_for_write_barrier(&self, request: &ServiceRequest, target_gclsn: i64) -> DriverResult<(bool, i64)> {
        let mut barrier = barrier_request(request, None, Some(target_gclsn));
        let options = ReplicaReadOptions {
            include_primary: true,
            replica_count_to_read: 1,
            requires_valid_lsn: false,
            use_session_token: false,
            check_min_lsn: false,
            force_read_all: true,
        };

        let attempts = self.config.max_write_barrier_retries;
        let mut highest_seen = -1;
        for attempt in 1..=attempts {
            barrier.check_live()?;
            if barrier.is_past_deadline() {
                debug!(target_gclsn, attempt, "Write barrier reached the request deadline");
                break;
            }
            let results = match self.store_reader.read_multiple_replicas(&mut barrier, options).await {
                Ok(results) => results,
                Err(e) if failed_on_deadline(&barrier, &e) => {
                    debug!(target_gclsn, attempt, "Write barrier reached the request deadline");
                    break;
                },
                Err(e) => return Err(e),
            };
            let max_gclsn = results.iter().map(|r| r.global_committed_lsn).max().unwrap_or(-1);
            highest_seen = highest_seen.max(max_gclsn);
            if max_gclsn >= target_gclsn {
                return Ok((true, highest_seen));
            }
            barrier.context.force_refresh_address_cache = false;
            if attempt < attempts {
                barrier.sleep(self.config.multi_region_barrier_delay(attempt)).await?;
            }
        }
        Ok((false, highest_seen))
    }
}
