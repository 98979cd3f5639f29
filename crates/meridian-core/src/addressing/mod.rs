//! Replica address discovery.
//!
//! `async_cache` de-duplicates concurrent fetches per key, `address_cache`
//! caches replica sets for one regional endpoint, `resolver` maps a request to
//! its partition and replica set, and `address_selector` picks replicas for
//! the quorum protocol.

pub mod address_cache;
pub mod address_selector;
pub mod async_cache;
pub mod resolver;

pub use address_cache::{AddressCache, OpenConnectionsSummary};
pub use address_selector::{enumerate_replicas, AddressSelector};
pub use async_cache::{AsyncCache, Versioned};
pub use resolver::PartitionAddressResolver;
