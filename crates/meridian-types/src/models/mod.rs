//! Domain models shared by the routing core.

pub mod address;
pub mod config;
pub mod partition;
pub mod region;
pub mod request;
pub mod resource_id;
pub mod status;
pub mod store;

pub use address::{PartitionAddresses, Protocol, ReplicaAddress, ServerKey};
pub use config::{AddressCacheConfig, DriverConfig, GlobalStrongWritePolicy, QuorumConfig};
pub use partition::{
    EpkRange, PartitionKeyRange, PartitionKeyRangeIdentity, MASTER_PARTITION_KEY_RANGE_ID,
    MAX_EXCLUSIVE_EPK, MIN_INCLUSIVE_EPK,
};
pub use region::{AccountRegion, AccountTopology, RegionEndpoint};
pub use request::{ConsistencyLevel, OperationType, ReadMode, ResourceType};
pub use resource_id::ResourceId;
pub use status::{is_error_status, status_codes, sub_status_codes, FailureKind};
pub use store::{headers, StoreResponse};
