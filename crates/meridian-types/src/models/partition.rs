//! Partition key ranges and their identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest effective partition key (inclusive).
pub const MIN_INCLUSIVE_EPK: &str = "";
/// Largest effective partition key (exclusive).
pub const MAX_EXCLUSIVE_EPK: &str = "FF";
/// Range id reserved for the master (metadata) partition.
pub const MASTER_PARTITION_KEY_RANGE_ID: &str = "M";

/// Half-open effective-partition-key interval `[min, max)`.
///
/// Bounds are hex strings compared ordinally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EpkRange {
    pub min: String,
    pub max: String,
}

impl EpkRange {
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self { min: min.into(), max: max.into() }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(MIN_INCLUSIVE_EPK, MAX_EXCLUSIVE_EPK)
    }

    /// Empty range anchored at `at`; continuation parsing starts from one.
    pub fn empty_at(at: impl Into<String>) -> Self {
        let at = at.into();
        Self { min: at.clone(), max: at }
    }

    pub fn is_empty(&self) -> bool {
        self.min == self.max
    }

    pub fn contains(&self, epk: &str) -> bool {
        self.min.as_str() <= epk && epk < self.max.as_str()
    }

    pub fn overlaps(&self, other: &EpkRange) -> bool {
        self.min < other.max && other.min < self.max
    }
}

impl fmt::Display for EpkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.min, self.max)
    }
}

/// One node of the partition forest.
///
/// `parents` lists the range ids this range replaced: one id after a split,
/// several after a merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    pub id: String,
    pub min_inclusive: String,
    pub max_exclusive: String,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(id: impl Into<String>, min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min.into(),
            max_exclusive: max.into(),
            parents: Vec::new(),
        }
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn to_range(&self) -> EpkRange {
        EpkRange::new(self.min_inclusive.clone(), self.max_exclusive.clone())
    }
}

/// Cache key for a partition's replica set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PartitionKeyRangeIdentity {
    pub collection_rid: String,
    pub partition_key_range_id: String,
}

impl PartitionKeyRangeIdentity {
    pub fn new(collection_rid: impl Into<String>, partition_key_range_id: impl Into<String>) -> Self {
        Self {
            collection_rid: collection_rid.into(),
            partition_key_range_id: partition_key_range_id.into(),
        }
    }

    /// Identity of the master partition.
    pub fn master() -> Self {
        Self::new(String::new(), MASTER_PARTITION_KEY_RANGE_ID)
    }

    pub fn is_master(&self) -> bool {
        self.partition_key_range_id == MASTER_PARTITION_KEY_RANGE_ID
    }
}

impl fmt::Display for PartitionKeyRangeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.collection_rid, self.partition_key_range_id)
    }
}
