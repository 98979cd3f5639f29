//! Status and sub-status codes shared by replica responses and typed failures.
//!
//! Retry and quorum logic never matches on raw numbers directly: both a thrown
//! [`crate::StoreError`] and a returned [`crate::StoreResponse`] are reduced to a
//! [`FailureKind`] through [`FailureKind::classify`], so the two paths always agree.

use serde::{Deserialize, Serialize};

/// HTTP-style status codes carried by replica responses.
pub mod status_codes {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const NO_CONTENT: u16 = 204;
    pub const NOT_MODIFIED: u16 = 304;
    /// First code treated as a failure status.
    pub const STARTING_ERROR_CODE: u16 = 400;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const CONFLICT: u16 = 409;
    pub const GONE: u16 = 410;
    pub const PRECONDITION_FAILED: u16 = 412;
    pub const TOO_MANY_REQUESTS: u16 = 429;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// Sub-status codes refining a status code.
pub mod sub_status_codes {
    pub const UNKNOWN: u32 = 0;
    /// 410: the collection resolved by name is stale
    pub const NAME_CACHE_IS_STALE: u32 = 1000;
    /// 410: the partition key range was split or merged away
    pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
    /// 410: the partition is completing a split
    pub const COMPLETING_SPLIT: u32 = 1007;
    /// 410: the partition is migrating
    pub const COMPLETING_PARTITION_MIGRATION: u32 = 1008;
    /// 404: no replica could satisfy the session token
    pub const READ_SESSION_NOT_AVAILABLE: u32 = 1002;
    /// 403: the region does not accept writes
    pub const WRITE_FORBIDDEN: u32 = 3;
    /// 403: the account is not present in the region
    pub const DATABASE_ACCOUNT_NOT_FOUND: u32 = 1008;
    /// 410: a transport-level failure was reported as Gone
    pub const TRANSPORT_GENERATED_GONE: u32 = 20001;
    /// 410: read quorum could not be established
    pub const READ_QUORUM_NOT_MET: u32 = 21007;
    /// 410: no replica returned a usable response
    pub const NO_VALID_STORE_RESPONSE: u32 = 21009;
    /// 410: the global-strong write barrier did not converge
    pub const GLOBAL_STRONG_WRITE_BARRIER_NOT_MET: u32 = 21012;
}

use status_codes as sc;
use sub_status_codes as ssc;

/// Failure classes that retry policies and the quorum protocol react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Replica or partition no longer valid
    Gone,
    /// Routing map is stale for this range
    PartitionKeyRangeGone,
    /// Collection resolved by name is stale
    InvalidPartition,
    /// Session token cannot be satisfied in this region
    ReadSessionNotAvailable,
    /// Region refuses writes
    WriteForbidden,
    /// Account missing from region
    DatabaseAccountNotFound,
    /// Endpoint unreachable or overloaded
    ServiceUnavailable,
    /// Request timed out at the endpoint
    RequestTimeout,
    /// Anything else, including success codes
    Other,
}

impl FailureKind {
    /// Reduce a status/sub-status pair to the class retry logic cares about.
    pub fn classify(status: u16, sub_status: u32) -> Self {
        match (status, sub_status) {
            (sc::GONE, ssc::PARTITION_KEY_RANGE_GONE)
            | (sc::GONE, ssc::COMPLETING_SPLIT)
            | (sc::GONE, ssc::COMPLETING_PARTITION_MIGRATION) => Self::PartitionKeyRangeGone,
            (sc::GONE, ssc::NAME_CACHE_IS_STALE) => Self::InvalidPartition,
            (sc::GONE, _) => Self::Gone,
            (sc::NOT_FOUND, ssc::READ_SESSION_NOT_AVAILABLE) => Self::ReadSessionNotAvailable,
            (sc::FORBIDDEN, ssc::WRITE_FORBIDDEN) => Self::WriteForbidden,
            (sc::FORBIDDEN, ssc::DATABASE_ACCOUNT_NOT_FOUND) => Self::DatabaseAccountNotFound,
            (sc::SERVICE_UNAVAILABLE, _) => Self::ServiceUnavailable,
            (sc::REQUEST_TIMEOUT, _) => Self::RequestTimeout,
            _ => Self::Other,
        }
    }
}

/// Whether a status code is a failure status.
pub fn is_error_status(status: u16) -> bool {
    status >= sc::STARTING_ERROR_CODE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_sub_status_differs_by_status() {
        assert_eq!(FailureKind::classify(410, 1002), FailureKind::PartitionKeyRangeGone);
        assert_eq!(FailureKind::classify(404, 1002), FailureKind::ReadSessionNotAvailable);
        assert_eq!(FailureKind::classify(404, 0), FailureKind::Other);
    }

    #[test]
    fn test_classify_forbidden() {
        assert_eq!(FailureKind::classify(403, 3), FailureKind::WriteForbidden);
        assert_eq!(FailureKind::classify(403, 1008), FailureKind::DatabaseAccountNotFound);
        assert_eq!(FailureKind::classify(403, 0), FailureKind::Other);
    }

    #[test]
    fn test_plain_gone() {
        assert_eq!(FailureKind::classify(410, 0), FailureKind::Gone);
        assert_eq!(FailureKind::classify(410, 1000), FailureKind::InvalidPartition);
        assert!(is_error_status(410));
        assert!(!is_error_status(204));
    }
}
