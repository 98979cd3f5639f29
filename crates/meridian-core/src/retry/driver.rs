use async_trait::async_trait;
use meridian_types::StoreResponse;
use tracing::{debug, info};

use super::{FailureSignal, RetryPolicy, ShouldRetryResult};
use crate::consistency::{ConsistencyReader, ConsistencyWriter};
use crate::error::{DriverError, DriverResult};
use crate::request::ServiceRequest;

/// One attempt of a store operation.
#[async_trait]
pub trait StoreOperation: Send + Sync {
    async fn execute(&self, request: &mut ServiceRequest) -> DriverResult<StoreResponse>;
}

#[async_trait]
impl StoreOperation for ConsistencyReader {
    async fn execute(&self, request: &mut ServiceRequest) -> DriverResult<StoreResponse> {
        self.read(request).await
    }
}

#[async_trait]
impl StoreOperation for ConsistencyWriter {
    async fn execute(&self, request: &mut ServiceRequest) -> DriverResult<StoreResponse> {
        self.write(request).await
    }
}

/// Run `operation` until it succeeds or `policy` stops retrying.
///
/// The final attempt's outcome is returned unchanged, so a failure-status
/// response the policy gave up on still comes back as `Ok`.
pub async fn execute_with_retry(
    policy: &mut dyn RetryPolicy,
    request: &mut ServiceRequest,
    operation: &dyn StoreOperation,
) -> DriverResult<StoreResponse> {
    let mut attempt: u32 = 0;
    loop {
        request.check_live()?;
        attempt += 1;
        policy.on_before_send_request(request);

        let outcome = operation.execute(request).await;
        let failure = match &outcome {
            Ok(response) => FailureSignal::from_response(response),
            Err(DriverError::Cancelled) => return outcome,
            Err(error) => Some(FailureSignal::from_error(error)),
        };
        let Some(failure) = failure else {
            return outcome;
        };

        match policy.should_retry(request, &failure).await {
            ShouldRetryResult::NoRetry => {
                debug!(attempt, kind = ?failure.kind, status = ?failure.status, "Giving up");
                return outcome;
            },
            ShouldRetryResult::RetryAfter(delay) => {
                info!(
                    activity_id = %request.activity_id,
                    attempt,
                    kind = ?failure.kind,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying operation"
                );
                if !delay.is_zero() {
                    request.sleep(delay).await?;
                }
            },
        }
    }
}
