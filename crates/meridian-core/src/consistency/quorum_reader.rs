//! Strong and bounded-staleness reads.
//!
//! A read first asks `R` secondaries. If a quorum already agrees on the
//! highest LSN the response is returned; if not, barrier requests poll the
//! replica set until the selected LSN (and, for global strong accounts, the
//! global committed LSN) is confirmed. When too few secondaries answer the
//! primary is read instead.

use std::sync::Arc;

use meridian_types::models::{headers, status_codes};
use meridian_types::{ConsistencyLevel, OperationType, QuorumConfig, ReadMode, StoreError, StoreResponse};
use tracing::{debug, info, warn};

use super::store_reader::{ensure_time_left, failed_on_deadline, ReplicaReadOptions, StoreReader};
use super::store_result::StoreResult;
use crate::error::{DriverError, DriverResult};
use crate::request::ServiceRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadQuorumKind {
    Met,
    Selected,
    NotSelected,
}

struct ReadQuorumResult {
    kind: ReadQuorumKind,
    selected_lsn: i64,
    global_committed_selected_lsn: i64,
    selected: Option<StoreResponse>,
}

impl ReadQuorumResult {
    fn not_selected() -> Self {
        Self { kind: ReadQuorumKind::NotSelected, selected_lsn: -1, global_committed_selected_lsn: -1, selected: None }
    }

    fn into_response(self) -> DriverResult<StoreResponse> {
        self.selected.ok_or_else(|| {
            StoreError::Internal { message: "quorum result without a selected response".to_string() }.into()
        })
    }
}

enum PrimaryReadOutcome {
    QuorumMet(StoreResponse),
    QuorumNotMet,
    /// Try the secondaries again
    QuorumInconclusive,
}

/// Outcome of checking one round of replica responses against the quorum.
#[derive(Debug, Clone)]
pub struct QuorumEvaluation {
    pub is_met: bool,
    /// LSN the read is pinned to
    pub read_lsn: i64,
    /// Global committed LSN barriers must reach (`-1` when not global strong)
    pub global_committed_lsn: i64,
    pub selected: StoreResponse,
}

/// Check whether `results` (all valid) satisfy a read quorum.
///
/// Among the responses at the highest LSN, success statuses are preferred and
/// ties go to the smallest activity id. The item-LSN rule also certifies the
/// read when the selected item is no newer than every replica's LSN.
pub fn evaluate_quorum(results: &[StoreResult], read_quorum: usize, account_strong: bool) -> Option<QuorumEvaluation> {
    let max_lsn = results.iter().map(|r| r.lsn).max()?;
    let min_lsn = results.iter().map(|r| r.lsn).min()?;
    let max_gclsn = results.iter().map(|r| r.global_committed_lsn).max().unwrap_or(-1);
    let max_read_regions = results.iter().map(|r| r.number_of_read_regions).max().unwrap_or(0);

    let at_max: Vec<&StoreResult> = results.iter().filter(|r| r.lsn == max_lsn).collect();
    let selected = at_max
        .iter()
        .min_by(|a, b| {
            (a.status_code() >= status_codes::BAD_REQUEST, &a.activity_id)
                .cmp(&(b.status_code() >= status_codes::BAD_REQUEST, &b.activity_id))
        })
        .copied()?;

    let check_global_strong = account_strong && max_read_regions > 0;
    let item_lsn = selected.item_lsn;
    let read_lsn = if item_lsn == -1 { max_lsn } else { item_lsn.min(max_lsn) };

    let met_on_max = read_lsn > 0 && at_max.len() >= read_quorum && (!check_global_strong || max_gclsn >= max_lsn);
    let met_on_item = results.len() >= read_quorum
        && item_lsn != -1
        && item_lsn <= min_lsn
        && (!check_global_strong || item_lsn <= max_gclsn);

    Some(QuorumEvaluation {
        is_met: met_on_max || met_on_item,
        read_lsn,
        global_committed_lsn: if check_global_strong { read_lsn } else { -1 },
        selected: selected.response.clone()?,
    })
}

/// Head request that asks replicas to report progress towards the given LSNs.
///
/// Shares the routing context of `request` and never carries a session token.
pub fn barrier_request(request: &ServiceRequest, target_lsn: Option<i64>, target_gclsn: Option<i64>) -> ServiceRequest {
    let mut barrier = request.clone();
    barrier.operation_type = OperationType::Head;
    barrier.headers.remove(headers::SESSION_TOKEN);
    barrier.headers.remove(headers::TARGET_LSN);
    barrier.headers.remove(headers::TARGET_GLOBAL_COMMITTED_LSN);
    if let Some(lsn) = target_lsn.filter(|l| *l >= 0) {
        barrier.headers.insert(headers::TARGET_LSN.to_string(), lsn.to_string());
    }
    if let Some(gclsn) = target_gclsn.filter(|l| *l >= 0) {
        barrier.headers.insert(headers::TARGET_GLOBAL_COMMITTED_LSN.to_string(), gclsn.to_string());
    }
    barrier
}

pub struct QuorumReader {
    store_reader: Arc<StoreReader>,
    config: QuorumConfig,
    account_strong: bool,
}

impl QuorumReader {
    pub fn new(store_reader: Arc<StoreReader>, config: QuorumConfig, account_consistency: ConsistencyLevel) -> Self {
        Self { store_reader, config, account_strong: account_consistency == ConsistencyLevel::Strong }
    }

    pub async fn read_strong(&self, request: &mut ServiceRequest, read_quorum: usize) -> DriverResult<StoreResponse> {
        self.read(request, read_quorum, ReadMode::Strong).await
    }

    pub async fn read_bounded_staleness(
        &self,
        request: &mut ServiceRequest,
        read_quorum: usize,
    ) -> DriverResult<StoreResponse> {
        self.read(request, read_quorum, ReadMode::BoundedStaleness).await
    }

    async fn read(&self, request: &mut ServiceRequest, read_quorum: usize, mode: ReadMode) -> DriverResult<StoreResponse> {
        let mut retries_left = self.config.max_read_quorum_retries;
        let mut has_read_primary = false;

        loop {
            ensure_time_left(request)?;
            let mut should_retry_on_secondary = false;
            let secondary = self.read_quorum(request, read_quorum, false, mode).await?;

            match secondary.kind {
                ReadQuorumKind::Met => return secondary.into_response(),
                ReadQuorumKind::Selected => {
                    let mut barrier = barrier_request(
                        request,
                        Some(secondary.selected_lsn),
                        Some(secondary.global_committed_selected_lsn),
                    );
                    let allow_primary = mode == ReadMode::Strong;
                    if self
                        .wait_for_read_barrier(
                            &mut barrier,
                            allow_primary,
                            read_quorum,
                            secondary.selected_lsn,
                            secondary.global_committed_selected_lsn,
                        )
                        .await?
                    {
                        return secondary.into_response();
                    }
                    warn!(
                        activity_id = %request.activity_id,
                        selected_lsn = secondary.selected_lsn,
                        global_committed_lsn = secondary.global_committed_selected_lsn,
                        "Read barrier did not converge on the selected LSN"
                    );
                    request.context.quorum_selected_lsn = secondary.selected_lsn;
                    request.context.global_committed_selected_lsn = secondary.global_committed_selected_lsn;
                    request.context.quorum_selected_store_response = secondary.selected;
                },
                ReadQuorumKind::NotSelected => {
                    if has_read_primary {
                        warn!(activity_id = %request.activity_id, "Primary already read and secondaries still lack a quorum");
                        return Err(self.quorum_not_met(request));
                    }
                    info!(activity_id = %request.activity_id, "Too few secondaries answered, reading primary");
                    has_read_primary = true;
                    match self.read_primary(request, read_quorum).await? {
                        PrimaryReadOutcome::QuorumMet(response) => return Ok(response),
                        PrimaryReadOutcome::QuorumNotMet => return Err(self.quorum_not_met(request)),
                        PrimaryReadOutcome::QuorumInconclusive => should_retry_on_secondary = true,
                    }
                },
            }

            retries_left = retries_left.saturating_sub(1);
            if retries_left == 0 || !should_retry_on_secondary {
                return Err(self.quorum_not_met(request));
            }
        }
    }

    fn quorum_not_met(&self, request: &ServiceRequest) -> DriverError {
        StoreError::ReadQuorumNotMet {
            selected_lsn: request.context.quorum_selected_lsn,
            global_committed_lsn: request.context.global_committed_selected_lsn,
        }
        .into()
    }

    async fn read_quorum(
        &self,
        request: &mut ServiceRequest,
        read_quorum: usize,
        include_primary: bool,
        mode: ReadMode,
    ) -> DriverResult<ReadQuorumResult> {
        let (selected_lsn, gclsn, selected) = match request.context.quorum_selected_store_response.clone() {
            Some(selected) => {
                (request.context.quorum_selected_lsn, request.context.global_committed_selected_lsn, selected)
            },
            None => {
                let options = ReplicaReadOptions { include_primary, ..ReplicaReadOptions::quorum(read_quorum) };
                let results = self.store_reader.read_multiple_replicas(request, options).await?;
                if results.len() < read_quorum {
                    debug!(valid = results.len(), read_quorum, "Read quorum not selected");
                    return Ok(ReadQuorumResult::not_selected());
                }
                let Some(evaluation) = evaluate_quorum(&results, read_quorum, self.account_strong) else {
                    return Ok(ReadQuorumResult::not_selected());
                };
                if evaluation.is_met {
                    return Ok(ReadQuorumResult {
                        kind: ReadQuorumKind::Met,
                        selected_lsn: evaluation.read_lsn,
                        global_committed_selected_lsn: evaluation.global_committed_lsn,
                        selected: Some(evaluation.selected),
                    });
                }
                // The replica set was just resolved; barriers reuse it.
                request.context.force_refresh_address_cache = false;
                (evaluation.read_lsn, evaluation.global_committed_lsn, evaluation.selected)
            },
        };

        debug!(selected_lsn, global_committed_lsn = gclsn, ?mode, "Waiting on read barrier for selected LSN");
        let mut barrier = barrier_request(request, Some(selected_lsn), Some(gclsn));
        let met = self.wait_for_read_barrier(&mut barrier, include_primary, read_quorum, selected_lsn, gclsn).await?;
        Ok(ReadQuorumResult {
            kind: if met { ReadQuorumKind::Met } else { ReadQuorumKind::Selected },
            selected_lsn,
            global_committed_selected_lsn: gclsn,
            selected: Some(selected),
        })
    }

    /// Poll until `read_quorum` replicas report `barrier_lsn` and, when
    /// `target_gclsn > 0`, the global committed LSN reached it.
    async fn wait_for_read_barrier(
        &self,
        barrier: &mut ServiceRequest,
        allow_primary: bool,
        read_quorum: usize,
        barrier_lsn: i64,
        target_gclsn: i64,
    ) -> DriverResult<bool> {
        let options = ReplicaReadOptions {
            include_primary: allow_primary,
            force_read_all: true,
            ..ReplicaReadOptions::quorum(read_quorum)
        };

        let local_attempts = self.config.max_read_barrier_retries;
        for attempt in 1..=local_attempts {
            check_barrier_deadline(barrier, barrier_lsn, target_gclsn)?;
            if self.barrier_attempt(barrier, options, read_quorum, barrier_lsn, target_gclsn).await? {
                return Ok(true);
            }
            if attempt < local_attempts {
                barrier.sleep(self.config.read_barrier_delay()).await?;
            }
        }

        if target_gclsn > 0 {
            let global_attempts = self.config.max_multi_region_barrier_retries;
            for attempt in 1..=global_attempts {
                check_barrier_deadline(barrier, barrier_lsn, target_gclsn)?;
                if self.barrier_attempt(barrier, options, read_quorum, barrier_lsn, target_gclsn).await? {
                    return Ok(true);
                }
                if attempt < global_attempts {
                    barrier.sleep(self.config.multi_region_barrier_delay(attempt)).await?;
                }
            }
        }
        Ok(false)
    }

    async fn barrier_attempt(
        &self,
        barrier: &mut ServiceRequest,
        options: ReplicaReadOptions,
        read_quorum: usize,
        barrier_lsn: i64,
        target_gclsn: i64,
    ) -> DriverResult<bool> {
        let results = match self.store_reader.read_multiple_replicas(barrier, options).await {
            Ok(results) => results,
            Err(e) if failed_on_deadline(barrier, &e) => {
                let (selected_lsn, global_committed_lsn) = (barrier_lsn, target_gclsn);
                return Err(StoreError::ReadQuorumNotMet { selected_lsn, global_committed_lsn }.into());
            },
            Err(e) => return Err(e),
        };
        let max_gclsn = results.iter().map(|r| r.global_committed_lsn).max().unwrap_or(-1);
        let caught_up = results.iter().filter(|r| r.lsn >= barrier_lsn).count();
        barrier.context.force_refresh_address_cache = false;
        Ok(caught_up >= read_quorum && (target_gclsn <= 0 || max_gclsn >= target_gclsn))
    }

    async fn read_primary(&self, request: &mut ServiceRequest, read_quorum: usize) -> DriverResult<PrimaryReadOutcome> {
        // Addresses were refreshed by the secondary read already.
        request.context.force_refresh_address_cache = false;
        let result = self.store_reader.read_primary(request, true, false).await?;
        let Some(first) = primary_lsns(&result, read_quorum)? else {
            return Ok(PrimaryReadOutcome::QuorumNotMet);
        };
        match first {
            PrimaryState::SetTooLarge => Ok(PrimaryReadOutcome::QuorumInconclusive),
            PrimaryState::Current => Ok(PrimaryReadOutcome::QuorumMet(result.into_response()?)),
            PrimaryState::Behind(target) => self.wait_for_primary_lsn(request, read_quorum, target).await,
        }
    }

    async fn wait_for_primary_lsn(
        &self,
        request: &mut ServiceRequest,
        read_quorum: usize,
        target_lsn: i64,
    ) -> DriverResult<PrimaryReadOutcome> {
        let attempts = self.config.max_primary_read_retries;
        for attempt in 1..=attempts {
            ensure_time_left(request)?;
            let result = self.store_reader.read_primary(request, true, false).await?;
            if primary_lsns(&result, read_quorum)?.is_none() {
                return Ok(PrimaryReadOutcome::QuorumNotMet);
            }
            if result.lsn >= target_lsn {
                return Ok(PrimaryReadOutcome::QuorumMet(result.into_response()?));
            }
            debug!(lsn = result.lsn, target_lsn, attempt, "Primary has not caught up");
            if attempt < attempts {
                request.sleep(self.config.read_barrier_delay()).await?;
            }
        }
        Ok(PrimaryReadOutcome::QuorumInconclusive)
    }
}

enum PrimaryState {
    SetTooLarge,
    Current,
    Behind(i64),
}

/// Classify a primary reply; `None` when its headers are unusable.
fn primary_lsns(result: &StoreResult, read_quorum: usize) -> DriverResult<Option<PrimaryState>> {
    if !result.is_valid {
        let error = result.error.clone().unwrap_or_else(|| StoreError::gone("invalid primary response"));
        return Err(error.into());
    }
    if result.current_replica_set_size <= 0 || result.lsn < 0 || result.quorum_acked_lsn < 0 {
        warn!(
            replica_set_size = result.current_replica_set_size,
            lsn = result.lsn,
            quorum_acked_lsn = result.quorum_acked_lsn,
            "Primary returned unusable LSN headers"
        );
        return Ok(None);
    }
    if result.current_replica_set_size as usize > read_quorum {
        info!(replica_set_size = result.current_replica_set_size, read_quorum, "Replica set larger than quorum");
        return Ok(Some(PrimaryState::SetTooLarge));
    }
    if result.lsn != result.quorum_acked_lsn {
        return Ok(Some(PrimaryState::Behind(result.lsn.max(result.quorum_acked_lsn))));
    }
    Ok(Some(PrimaryState::Current))
}

fn check_barrier_deadline(request: &ServiceRequest, lsn: i64, gclsn: i64) -> DriverResult<()> {
    request.check_live()?;
    if request.is_past_deadline() {
        return Err(StoreError::ReadQuorumNotMet { selected_lsn: lsn, global_committed_lsn: gclsn }.into());
    }
    Ok(())
}
