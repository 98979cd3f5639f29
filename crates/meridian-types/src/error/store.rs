//! Replica, transport, and consistency failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::status::{status_codes as sc, sub_status_codes as ssc, FailureKind};

/// Typed failure returned by a replica call or by the consistency layer.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum StoreError {
    /// Endpoint, replica, or partition no longer valid
    #[error("Gone (sub-status {sub_status}): {message}")]
    Gone { sub_status: u32, message: String },

    /// Partition key range was split, merged, or is migrating
    #[error("Partition key range gone: {message}")]
    PartitionKeyRangeGone { message: String },

    /// Name-based collection resolution is stale
    #[error("Invalid partition: {message}")]
    InvalidPartition { message: String },

    /// No replica in this region satisfies the session token
    #[error("Read session not available: {message}")]
    ReadSessionNotAvailable { message: String },

    /// Region does not accept writes
    #[error("Write forbidden: {message}")]
    WriteForbidden { message: String },

    /// Account is not present in the region
    #[error("Database account not found: {message}")]
    DatabaseAccountNotFound { message: String },

    /// Quorum could not be established before retries or the deadline ran out
    #[error("Read quorum not met (selected LSN {selected_lsn}, global committed LSN {global_committed_lsn})")]
    ReadQuorumNotMet { selected_lsn: i64, global_committed_lsn: i64 },

    /// Global commit of a strong write did not catch up
    #[error("Global strong write barrier not met (LSN {lsn}, global committed LSN {global_committed_lsn})")]
    GlobalStrongWriteBarrierNotMet { lsn: i64, global_committed_lsn: i64 },

    /// Request timed out at the transport
    #[error("Request timeout: {message}")]
    RequestTimeout { message: String },

    /// Connection to the replica was reset or refused
    #[error("Connection to {endpoint} reset: {message}")]
    ConnectionReset { endpoint: String, message: String },

    /// Endpoint unavailable or overloaded
    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// Any other failure status returned by a replica
    #[error("Request failed with status {status} (sub-status {sub_status}): {message}")]
    Status { status: u16, sub_status: u32, message: String },

    /// Broken invariant inside the consistency layer
    #[error("Internal consistency error: {message}")]
    Internal { message: String },
}

impl StoreError {
    /// Build the typed failure matching a status/sub-status pair.
    pub fn from_status(status: u16, sub_status: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        match FailureKind::classify(status, sub_status) {
            FailureKind::Gone => Self::Gone { sub_status, message },
            FailureKind::PartitionKeyRangeGone => Self::PartitionKeyRangeGone { message },
            FailureKind::InvalidPartition => Self::InvalidPartition { message },
            FailureKind::ReadSessionNotAvailable => Self::ReadSessionNotAvailable { message },
            FailureKind::WriteForbidden => Self::WriteForbidden { message },
            FailureKind::DatabaseAccountNotFound => Self::DatabaseAccountNotFound { message },
            FailureKind::ServiceUnavailable => Self::ServiceUnavailable { message },
            FailureKind::RequestTimeout => Self::RequestTimeout { message },
            FailureKind::Other => Self::Status { status, sub_status, message },
        }
    }

    /// Plain Gone with no refinement.
    pub fn gone(message: impl Into<String>) -> Self {
        Self::Gone { sub_status: ssc::UNKNOWN, message: message.into() }
    }

    /// Get the status code this failure reports.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Gone { .. }
            | Self::PartitionKeyRangeGone { .. }
            | Self::InvalidPartition { .. }
            | Self::ReadQuorumNotMet { .. }
            | Self::GlobalStrongWriteBarrierNotMet { .. }
            | Self::ConnectionReset { .. } => sc::GONE,
            Self::ReadSessionNotAvailable { .. } => sc::NOT_FOUND,
            Self::WriteForbidden { .. } | Self::DatabaseAccountNotFound { .. } => sc::FORBIDDEN,
            Self::RequestTimeout { .. } => sc::REQUEST_TIMEOUT,
            Self::ServiceUnavailable { .. } => sc::SERVICE_UNAVAILABLE,
            Self::Status { status, .. } => *status,
            Self::Internal { .. } => sc::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the sub-status code this failure reports.
    pub fn sub_status(&self) -> u32 {
        match self {
            Self::Gone { sub_status, .. } | Self::Status { sub_status, .. } => *sub_status,
            Self::PartitionKeyRangeGone { .. } => ssc::PARTITION_KEY_RANGE_GONE,
            Self::InvalidPartition { .. } => ssc::NAME_CACHE_IS_STALE,
            Self::ReadSessionNotAvailable { .. } => ssc::READ_SESSION_NOT_AVAILABLE,
            Self::WriteForbidden { .. } => ssc::WRITE_FORBIDDEN,
            Self::DatabaseAccountNotFound { .. } => ssc::DATABASE_ACCOUNT_NOT_FOUND,
            Self::ReadQuorumNotMet { .. } => ssc::READ_QUORUM_NOT_MET,
            Self::GlobalStrongWriteBarrierNotMet { .. } => ssc::GLOBAL_STRONG_WRITE_BARRIER_NOT_MET,
            Self::ConnectionReset { .. } => ssc::TRANSPORT_GENERATED_GONE,
            Self::RequestTimeout { .. } | Self::ServiceUnavailable { .. } | Self::Internal { .. } => {
                ssc::UNKNOWN
            },
        }
    }

    /// Failure class used by retry policies.
    pub fn failure_kind(&self) -> FailureKind {
        FailureKind::classify(self.status_code(), self.sub_status())
    }

    /// Check if this failure is in the Gone class (410).
    pub fn is_gone(&self) -> bool {
        self.status_code() == sc::GONE
    }

    /// Check if the failure happened below the protocol (socket reset, timeout).
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::ConnectionReset { .. } | Self::RequestTimeout { .. })
    }

    /// Failures that must abort a multi-replica read instead of counting as one bad replica.
    pub fn aborts_replica_fan_out(&self) -> bool {
        matches!(self, Self::PartitionKeyRangeGone { .. })
            || (matches!(self, Self::Status { status, .. } if *status == sc::BAD_REQUEST))
    }
}
