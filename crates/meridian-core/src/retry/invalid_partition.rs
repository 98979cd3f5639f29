use async_trait::async_trait;
use meridian_types::FailureKind;
use tracing::debug;

use super::{defer_to, FailureSignal, RetryPolicy, ShouldRetryResult};
use crate::request::ServiceRequest;

/// Tail of the default chain.
///
/// A stale name cache is surfaced to the caller unless a policy further down
/// knows how to recover.
#[derive(Default)]
pub struct InvalidPartitionRetryPolicy {
    next: Option<Box<dyn RetryPolicy>>,
}

impl InvalidPartitionRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next(mut self, next: Box<dyn RetryPolicy>) -> Self {
        self.next = Some(next);
        self
    }
}

#[async_trait]
impl RetryPolicy for InvalidPartitionRetryPolicy {
    fn on_before_send_request(&mut self, request: &mut ServiceRequest) {
        if let Some(next) = self.next.as_mut() {
            next.on_before_send_request(request);
        }
    }

    async fn should_retry(&mut self, request: &ServiceRequest, failure: &FailureSignal) -> ShouldRetryResult {
        if failure.kind == FailureKind::InvalidPartition {
            debug!(resource = %request.resource_address, "Collection name cache is stale");
        }
        defer_to(&mut self.next, request, failure).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use meridian_types::{OperationType, ResourceType};

    use super::*;

    struct Always(ShouldRetryResult);

    #[async_trait]
    impl RetryPolicy for Always {
        fn on_before_send_request(&mut self, _request: &mut ServiceRequest) {}

        async fn should_retry(&mut self, _request: &ServiceRequest, _failure: &FailureSignal) -> ShouldRetryResult {
            self.0
        }
    }

    fn invalid() -> FailureSignal {
        FailureSignal { kind: FailureKind::InvalidPartition, status: Some(410), sub_status: Some(1000) }
    }

    #[tokio::test]
    async fn test_refuses_without_next() {
        let request = ServiceRequest::new(OperationType::Read, ResourceType::Document, "dbs/d/colls/c/docs/x");
        let mut policy = InvalidPartitionRetryPolicy::new();
        assert_eq!(policy.should_retry(&request, &invalid()).await, ShouldRetryResult::NoRetry);
    }

    #[tokio::test]
    async fn test_defers_to_next() {
        let request = ServiceRequest::new(OperationType::Read, ResourceType::Document, "dbs/d/colls/c/docs/x");
        let delay = ShouldRetryResult::RetryAfter(Duration::from_millis(5));
        let mut policy = InvalidPartitionRetryPolicy::new().with_next(Box::new(Always(delay)));
        assert_eq!(policy.should_retry(&request, &invalid()).await, delay);
    }
}
