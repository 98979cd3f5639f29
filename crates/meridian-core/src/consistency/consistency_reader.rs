//! Consistency-level dispatch for reads.

use std::sync::Arc;

use meridian_types::models::{status_codes, sub_status_codes};
use meridian_types::{ConsistencyLevel, QuorumConfig, ReadMode, StoreError, StoreResponse};
use tracing::info;

use super::quorum_reader::QuorumReader;
use super::store_reader::{ensure_time_left, ReplicaReadOptions, StoreReader};
use crate::error::DriverResult;
use crate::request::ServiceRequest;

/// Picks how many replicas a read consults from its consistency level.
///
/// | Level | Replicas |
/// |---|---|
/// | Strong | read quorum, barriers may include the primary |
/// | BoundedStaleness | read quorum, barriers on secondaries only |
/// | Session | any replica satisfying the session token |
/// | Eventual, ConsistentPrefix | any replica |
pub struct ConsistencyReader {
    store_reader: Arc<StoreReader>,
    quorum_reader: QuorumReader,
    read_quorum: usize,
    account_consistency: ConsistencyLevel,
}

impl ConsistencyReader {
    pub fn new(store_reader: Arc<StoreReader>, config: QuorumConfig, account_consistency: ConsistencyLevel) -> Self {
        Self {
            quorum_reader: QuorumReader::new(Arc::clone(&store_reader), config, account_consistency),
            store_reader,
            read_quorum: config.read_quorum(),
            account_consistency,
        }
    }

    pub async fn read(&self, request: &mut ServiceRequest) -> DriverResult<StoreResponse> {
        ensure_time_left(request)?;
        let target = request.consistency_level.unwrap_or(self.account_consistency);
        if strength(target) > strength(self.account_consistency) {
            return Err(StoreError::Status {
                status: status_codes::BAD_REQUEST,
                sub_status: sub_status_codes::UNKNOWN,
                message: format!("consistency {target} is stronger than the account's {}", self.account_consistency),
            }
            .into());
        }

        if request.pin_to_primary {
            let result = self.store_reader.read_primary(request, false, false).await?;
            return Ok(result.into_response()?);
        }

        match ReadMode::for_consistency(target) {
            ReadMode::Strong | ReadMode::Primary => self.quorum_reader.read_strong(request, self.read_quorum).await,
            ReadMode::BoundedStaleness => self.quorum_reader.read_bounded_staleness(request, self.read_quorum).await,
            ReadMode::Any if target == ConsistencyLevel::Session => self.read_session(request).await,
            ReadMode::Any => self.read_any(request).await,
        }
    }

    async fn read_any(&self, request: &mut ServiceRequest) -> DriverResult<StoreResponse> {
        let options = ReplicaReadOptions {
            include_primary: true,
            replica_count_to_read: 1,
            requires_valid_lsn: false,
            use_session_token: false,
            check_min_lsn: false,
            force_read_all: false,
        };
        let results = self.store_reader.read_multiple_replicas(request, options).await?;
        let first = results.into_iter().next().ok_or_else(|| StoreError::gone("no replica answered"))?;
        Ok(first.into_response()?)
    }

    async fn read_session(&self, request: &mut ServiceRequest) -> DriverResult<StoreResponse> {
        let options = ReplicaReadOptions {
            include_primary: true,
            replica_count_to_read: 1,
            requires_valid_lsn: true,
            use_session_token: true,
            check_min_lsn: true,
            force_read_all: false,
        };
        let results = self.store_reader.read_multiple_replicas(request, options).await?;
        if let Some(first) = results.into_iter().next() {
            return Ok(first.into_response()?);
        }

        let required = request.context.session_token.as_ref().map_or_else(|| "<empty>".to_string(), ToString::to_string);
        info!(resource = %request.resource_address, session_token = %required, "No replica satisfies the session token");
        Err(StoreError::ReadSessionNotAvailable {
            message: format!("no replica has reached session token {required}"),
        }
        .into())
    }
}

fn strength(level: ConsistencyLevel) -> u8 {
    match level {
        ConsistencyLevel::Eventual => 0,
        ConsistencyLevel::ConsistentPrefix => 1,
        ConsistencyLevel::Session => 2,
        ConsistencyLevel::BoundedStaleness => 3,
        ConsistencyLevel::Strong => 4,
    }
}

#[cfg(test)]
mod tests {
    use meridian_types::models::headers;
    use meridian_types::{FailureKind, OperationType, PartitionKeyRange, Protocol, ReplicaAddress, ResourceType};

    use super::*;
    use crate::addressing::AddressSelector;
    use crate::session::SessionContainer;
    use crate::testing::{replicas, FakeAddressResolver, FakeTransport};

    fn consistency_reader(
        transport: FakeTransport,
        set: &[ReplicaAddress],
        account: ConsistencyLevel,
    ) -> (ConsistencyReader, Arc<FakeTransport>) {
        let transport = Arc::new(transport);
        let selector = Arc::new(AddressSelector::new(FakeAddressResolver::new(set.to_vec()), Protocol::Rntbd));
        let reader = Arc::new(StoreReader::new(transport.clone(), selector, Arc::new(SessionContainer::new())));
        (ConsistencyReader::new(reader, QuorumConfig::default(), account), transport)
    }

    fn read() -> ServiceRequest {
        let mut request = ServiceRequest::new(OperationType::Read, ResourceType::Document, "dbs/d/colls/c/docs/x");
        request.context.resolved_partition_key_range = Some(PartitionKeyRange::new("0", "", "FF"));
        request
    }

    #[tokio::test]
    async fn test_eventual_reads_one_replica() {
        let set = replicas("0", 4);
        let mut transport = FakeTransport::new();
        for replica in &set {
            transport = transport.with_response(replica, Ok(StoreResponse::ok(3)));
        }
        let (reader, transport) = consistency_reader(transport, &set, ConsistencyLevel::Session);

        let response = reader.read(&mut read().with_consistency(ConsistencyLevel::Eventual)).await.unwrap();
        assert_eq!(response.lsn, 3);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_session_read_finds_caught_up_replica() {
        let set = replicas("0", 3);
        let transport = FakeTransport::new()
            .with_response(&set[0], Ok(StoreResponse::ok(20).with_session_token("0:1#20")))
            .with_response(&set[1], Ok(StoreResponse::ok(8).with_session_token("0:1#8")))
            .with_response(&set[2], Ok(StoreResponse::ok(9).with_session_token("0:1#9")));
        let (reader, _) = consistency_reader(transport, &set, ConsistencyLevel::Session);
        let mut request = read().with_header(headers::SESSION_TOKEN, "0:1#15");

        let response = reader.read(&mut request).await.unwrap();
        assert_eq!(response.lsn, 20);
    }

    #[tokio::test]
    async fn test_session_read_not_available() {
        let set = replicas("0", 3);
        let mut transport = FakeTransport::new();
        for replica in &set {
            transport = transport.with_response(replica, Ok(StoreResponse::ok(8).with_session_token("0:1#8")));
        }
        let (reader, _) = consistency_reader(transport, &set, ConsistencyLevel::Session);
        let mut request = read().with_header(headers::SESSION_TOKEN, "0:1#15");

        let err = reader.read(&mut request).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::ReadSessionNotAvailable);
        assert_eq!(err.status_code(), Some(404));
    }

    #[tokio::test(start_paused = true)]
    async fn test_strong_account_uses_quorum() {
        let set = replicas("0", 4);
        let mut transport = FakeTransport::new();
        for replica in &set {
            transport = transport.with_response(replica, Ok(StoreResponse::ok(7)));
        }
        let (reader, transport) = consistency_reader(transport, &set, ConsistencyLevel::Strong);

        let response = reader.read(&mut read()).await.unwrap();
        assert_eq!(response.lsn, 7);
        assert_eq!(transport.calls(), 2);
        assert_eq!(transport.calls_to(&set[0]), 0);
    }

    #[tokio::test]
    async fn test_pinned_request_reads_primary() {
        let set = replicas("0", 4);
        let transport = FakeTransport::new().with_response(&set[0], Ok(StoreResponse::ok(11)));
        let (reader, transport) = consistency_reader(transport, &set, ConsistencyLevel::Eventual);

        let response = reader.read(&mut read().pinned_to_primary()).await.unwrap();
        assert_eq!(response.lsn, 11);
        assert_eq!(transport.calls_to(&set[0]), 1);
    }

    #[tokio::test]
    async fn test_stronger_than_account_rejected() {
        let set = replicas("0", 3);
        let (reader, transport) = consistency_reader(FakeTransport::new(), &set, ConsistencyLevel::Session);

        let err = reader.read(&mut read().with_consistency(ConsistencyLevel::Strong)).await.unwrap_err();
        assert_eq!(err.status_code(), Some(400));
        assert_eq!(transport.calls(), 0);
    }
}
