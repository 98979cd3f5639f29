//! # Meridian Core
//!
//! Client-side routing, session consistency and failover for a multi-region
//! document database driver.
//!
//! ## Architecture
//!
//! ```text
//! meridian-core/src/
//! ├── routing/       # location cache, endpoint manager, region names
//! ├── session/       # session tokens and the per-collection container
//! ├── addressing/    # replica address cache and partition address resolution
//! ├── consistency/   # store reader, quorum reader, consistency writer, continuations
//! ├── retry/         # client, partition-gone and invalid-partition policies
//! ├── gateway/       # HTTP topology and address sources
//! ├── telemetry.rs   # tracing subscriber setup for embedders
//! └── transport.rs   # collaborator traits
//! ```
//!
//! The wire codec, query iteration and request signing are out of scope: they
//! plug in through the traits in [`transport`].

#![allow(
    clippy::significant_drop_tightening,
    reason = "DashMap and parking_lot guards are scoped to the statement that needs them"
)]
#![allow(
    clippy::wildcard_enum_match_arm,
    reason = "Failure classification only reacts to a few kinds and forwards the rest"
)]
#![allow(clippy::module_name_repetitions, reason = "Type names mirror their module's role")]
#![allow(
    clippy::missing_errors_doc,
    reason = "Errors are the DriverError taxonomy documented on the type"
)]
#![allow(clippy::needless_continue, reason = "Explicit continue improves loop readability")]
// Test-only lints: allow panic!, unwrap, etc. in test code
#![cfg_attr(
    test,
    allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::print_stdout,
        clippy::assertions_on_result_states
    )
)]

pub mod addressing;
pub mod consistency;
pub mod error;
pub mod gateway;
pub mod request;
pub mod retry;
pub mod routing;
pub mod session;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use error::{DriverError, DriverResult};
pub use request::{RequestContext, ServiceRequest};
pub use routing::{EndpointManager, LocationCache};
pub use session::{SessionContainer, SessionToken};
