//! Retry orchestration.
//!
//! Policies form a decorator chain. Each one handles the failure classes it
//! knows and hands everything else to the next policy:
//!
//! ```text
//! ClientRetryPolicy ──> PartitionKeyRangeGoneRetryPolicy ──> InvalidPartitionRetryPolicy
//! ```
//!
//! [`execute_with_retry`] runs one operation under a chain. A thrown failure
//! and a returned failure-status response are treated the same way.

mod client_policy;
mod driver;
mod invalid_partition;
mod partition_key_range_gone;

use std::time::Duration;

use async_trait::async_trait;
use meridian_types::{FailureKind, StoreResponse};

use crate::error::DriverError;
use crate::request::ServiceRequest;

pub use client_policy::ClientRetryPolicy;
pub use driver::{execute_with_retry, StoreOperation};
pub use invalid_partition::InvalidPartitionRetryPolicy;
pub use partition_key_range_gone::PartitionKeyRangeGoneRetryPolicy;

// ============================================================================
// Policy contract
// ============================================================================

/// Decision returned by a policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldRetryResult {
    NoRetry,
    RetryAfter(Duration),
}

impl ShouldRetryResult {
    pub fn retry_now() -> Self {
        Self::RetryAfter(Duration::ZERO)
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryAfter(_))
    }
}

/// The part of a failed attempt retry policies look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureSignal {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub sub_status: Option<u32>,
}

impl FailureSignal {
    pub fn from_error(error: &DriverError) -> Self {
        Self {
            kind: error.failure_kind(),
            status: error.status_code(),
            sub_status: error.sub_status(),
        }
    }

    /// `None` for a successful response.
    pub fn from_response(response: &StoreResponse) -> Option<Self> {
        response.is_error().then(|| Self {
            kind: response.failure_kind(),
            status: Some(response.status),
            sub_status: Some(response.sub_status),
        })
    }
}

#[async_trait]
pub trait RetryPolicy: Send {
    /// Called before every attempt, including the first.
    fn on_before_send_request(&mut self, request: &mut ServiceRequest);

    async fn should_retry(&mut self, request: &ServiceRequest, failure: &FailureSignal) -> ShouldRetryResult;
}

/// Defer to `next`, or refuse when the chain ends here.
pub(crate) async fn defer_to(
    next: &mut Option<Box<dyn RetryPolicy>>,
    request: &ServiceRequest,
    failure: &FailureSignal,
) -> ShouldRetryResult {
    match next {
        Some(policy) => policy.should_retry(request, failure).await,
        None => ShouldRetryResult::NoRetry,
    }
}
