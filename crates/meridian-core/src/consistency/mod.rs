//! Replication consistency.
//!
//! ```text
//! ConsistencyReader ── Strong / BoundedStaleness ──> QuorumReader ──┐
//!        │                                                          ├──> StoreReader ──> TransportClient
//!        └──────────── Session / Eventual / primary ────────────────┘
//! ConsistencyWriter ── primary write, global-strong barrier ──> StoreReader
//! ```
//!
//! `continuation` keeps feed paging correct when partition ranges split.

mod consistency_reader;
mod consistency_writer;
pub mod continuation;
mod quorum_reader;
mod store_reader;
mod store_result;

pub use consistency_reader::ConsistencyReader;
pub use consistency_writer::ConsistencyWriter;
pub use continuation::{
    extract_range_from_continuation, try_add_range_to_continuation, try_get_target_range_from_continuation,
    CompositeContinuationToken, EnumerationDirection, ResolvedRangeInfo,
};
pub use quorum_reader::{barrier_request, evaluate_quorum, QuorumEvaluation, QuorumReader};
pub use store_reader::{ReplicaReadOptions, StoreReader};
pub use store_result::StoreResult;
