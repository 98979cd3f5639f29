//! Unified error type for the routing core.

use meridian_types::models::status::FailureKind;
use meridian_types::{ConfigError, StoreError, TypedError};
use serde::Serialize;
use thiserror::Error;

/// Main error type for all driver-core operations.
///
/// Gateway failures are kept as messages so the type stays `Clone`: a single
/// de-duplicated fetch hands the same outcome to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DriverError {
    /// Invalid configuration or account/config mismatch.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Replica, partition, or consistency failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Gateway request failed (HTTP client).
    #[error("Network error: {0}")]
    Network(String),

    /// Gateway payload could not be decoded.
    #[error("JSON error: {0}")]
    Json(String),

    /// A gateway-supplied or derived URL was malformed.
    #[error("URL error: {0}")]
    Url(String),

    /// Resource is not known to the gateway.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Serialize for DriverError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

/// Result type alias for driver-core operations.
pub type DriverResult<T> = Result<T, DriverError>;

impl From<TypedError> for DriverError {
    fn from(e: TypedError) -> Self {
        match e {
            TypedError::Config(c) => Self::Config(c),
            TypedError::Store(s) => Self::Store(s),
        }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Json(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl From<url::ParseError> for DriverError {
    fn from(e: url::ParseError) -> Self {
        Self::Url(e.to_string())
    }
}

impl DriverError {
    /// Status code of the underlying failure, if it has one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Store(e) => Some(e.status_code()),
            Self::NotFound(_) => Some(meridian_types::models::status_codes::NOT_FOUND),
            _ => None,
        }
    }

    pub fn sub_status(&self) -> Option<u32> {
        match self {
            Self::Store(e) => Some(e.sub_status()),
            _ => None,
        }
    }

    /// Failure class retry policies react to.
    ///
    /// Gateway connectivity failures count as `ServiceUnavailable` so the
    /// client policy fails over the same way it does for a 503.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Store(e) => e.failure_kind(),
            Self::Network(_) => FailureKind::ServiceUnavailable,
            _ => FailureKind::Other,
        }
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_gone())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Borrow the store failure, if this is one.
    pub fn as_store(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_kind_passes_through() {
        let err = DriverError::from(StoreError::WriteForbidden { message: "ro".to_string() });
        assert_eq!(err.failure_kind(), FailureKind::WriteForbidden);
        assert_eq!(err.status_code(), Some(403));
        assert_eq!(err.sub_status(), Some(3));
    }

    #[test]
    fn test_network_counts_as_unavailable() {
        let err = DriverError::Network("connection refused".to_string());
        assert_eq!(err.failure_kind(), FailureKind::ServiceUnavailable);
        assert!(!err.is_gone());
    }

    #[test]
    fn test_typed_error_unwraps() {
        let err = DriverError::from(TypedError::Config(ConfigError::ConflictingRegionOptions));
        assert_eq!(err, DriverError::Config(ConfigError::ConflictingRegionOptions));
    }
}
