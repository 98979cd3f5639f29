//! Session-consistency tracking.
//!
//! `token` holds the vector token type and its merge rules; `container` keeps
//! the latest token of every partition, keyed by collection identity.

mod container;
mod token;


pub use container::SessionContainer;
pub use token::{parse_partitioned_tokens, resolve_for_range, SessionToken};
