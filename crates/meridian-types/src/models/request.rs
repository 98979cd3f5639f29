//! Operation, resource, and consistency enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Replace,
    Upsert,
    Patch,
    Delete,
    Batch,
    ExecuteJavaScript,
    Read,
    ReadFeed,
    Query,
    Head,
    HeadFeed,
}

impl OperationType {
    /// Check if the operation mutates state and must be routed to a write region.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::Create
                | Self::Replace
                | Self::Upsert
                | Self::Patch
                | Self::Delete
                | Self::Batch
                | Self::ExecuteJavaScript
        )
    }

    pub fn is_read_only(self) -> bool {
        !self.is_write()
    }

    fn is_feed(self) -> bool {
        matches!(self, Self::ReadFeed | Self::Query | Self::HeadFeed)
    }
}

/// Resource kind a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    DatabaseAccount,
    Database,
    Collection,
    Document,
    StoredProcedure,
    Trigger,
    UserDefinedFunction,
    Conflict,
    Attachment,
    PartitionKeyRange,
    User,
    Permission,
    Offer,
    Address,
}

impl ResourceType {
    /// Check if reads of this resource are served by the master partition.
    ///
    /// Collection feeds and queries are served by the data partitions.
    pub fn is_reading_from_master(self, operation: OperationType) -> bool {
        match self {
            Self::DatabaseAccount
            | Self::Database
            | Self::User
            | Self::Permission
            | Self::Offer
            | Self::PartitionKeyRange => true,
            Self::Collection => !operation.is_feed(),
            _ => false,
        }
    }

    /// Resource kinds that can be written in any write region under multi-write.
    pub fn supports_multi_region_writes(self, operation: OperationType) -> bool {
        self == Self::Document
            || (self == Self::StoredProcedure && operation == OperationType::ExecuteJavaScript)
    }
}

/// Consistency level requested for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    #[default]
    Session,
    Eventual,
    ConsistentPrefix,
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyLevel::Strong => write!(f, "Strong"),
            ConsistencyLevel::BoundedStaleness => write!(f, "BoundedStaleness"),
            ConsistencyLevel::Session => write!(f, "Session"),
            ConsistencyLevel::Eventual => write!(f, "Eventual"),
            ConsistencyLevel::ConsistentPrefix => write!(f, "ConsistentPrefix"),
        }
    }
}

/// How many replicas a read must consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadMode {
    /// Primary replica only
    Primary,
    /// Read quorum with barriers, primary allowed as a barrier
    Strong,
    /// Read quorum without barrier reads on the primary
    BoundedStaleness,
    /// Any single replica
    Any,
}

impl ReadMode {
    /// Derive the read mode for a consistency level.
    pub fn for_consistency(level: ConsistencyLevel) -> Self {
        match level {
            ConsistencyLevel::Strong => Self::Strong,
            ConsistencyLevel::BoundedStaleness => Self::BoundedStaleness,
            ConsistencyLevel::Session
            | ConsistencyLevel::Eventual
            | ConsistencyLevel::ConsistentPrefix => Self::Any,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_classification() {
        assert!(OperationType::Upsert.is_write());
        assert!(OperationType::ExecuteJavaScript.is_write());
        assert!(OperationType::Query.is_read_only());
        assert!(OperationType::Head.is_read_only());
    }

    #[test]
    fn test_master_resources() {
        assert!(ResourceType::Database.is_reading_from_master(OperationType::Read));
        assert!(ResourceType::Collection.is_reading_from_master(OperationType::Read));
        assert!(!ResourceType::Collection.is_reading_from_master(OperationType::ReadFeed));
        assert!(!ResourceType::Document.is_reading_from_master(OperationType::Read));
    }

    #[test]
    fn test_read_mode_mapping() {
        assert_eq!(ReadMode::for_consistency(ConsistencyLevel::Strong), ReadMode::Strong);
        assert_eq!(ReadMode::for_consistency(ConsistencyLevel::Session), ReadMode::Any);
        assert_eq!(
            ReadMode::for_consistency(ConsistencyLevel::BoundedStaleness),
            ReadMode::BoundedStaleness
        );
    }
}
