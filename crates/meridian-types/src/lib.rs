//! # Meridian Types
//!
//! Core types, models, and error definitions for the Meridian routing core.
//!
//! This crate provides the foundational type system shared by the driver core:
//!
//! - **`error`** - Typed error hierarchy for configuration and replica/consistency failures
//! - **`models`** - Domain models (regions, partition key ranges, replica addresses,
//!   store responses, resource ids, driver configuration)
//!
//! ## Architecture Role
//!
//! `meridian-types` sits at the bottom of the dependency graph:
//!
//! ```text
//!                meridian-types (this crate)
//!                        │
//!                        ▼
//!                  meridian-core
//!                        │
//!                        ▼
//!                  meridian-probe
//! ```
//!
//! All types are designed to be:
//! - **Serializable** via serde for diagnostics and gateway payloads
//! - **Clone** for cheap sharing across async boundaries
//! - **PartialEq** for testing and comparison

pub mod error;
pub mod models;

// Re-export error types for convenience
pub use error::{ConfigError, Result, StoreError, TypedError};

// Re-export core model types
pub use models::{
    AccountRegion, AccountTopology, AddressCacheConfig, ConsistencyLevel, DriverConfig, EpkRange,
    FailureKind, GlobalStrongWritePolicy, OperationType, PartitionAddresses, PartitionKeyRange,
    PartitionKeyRangeIdentity, Protocol, QuorumConfig, ReadMode, RegionEndpoint, ReplicaAddress,
    ResourceId, ResourceType, ServerKey, StoreResponse, MAX_EXCLUSIVE_EPK, MIN_INCLUSIVE_EPK,
};
