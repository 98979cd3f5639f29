//! Region and endpoint selection.

pub mod endpoint_manager;
pub mod location_cache;
pub mod region_names;

pub use endpoint_manager::{derive_regional_endpoint, EndpointManager};
pub use location_cache::{LocationCache, LocationInfo, OperationKind};
pub use region_names::{canonical_region_name, normalize_region_name, same_region};
