//! The conflict-free replicated document core.
//!
//! - [`op`] — operation identifiers, tagged edit ops, the binary update codec
//! - [`text`] — the sequence CRDT itself (tombstoned item forest)
//!
//! Replicas exchange opaque [`Update`] byte deltas; applying the same
//! multiset of updates in any order on any replica converges to the
//! same text. Nothing in here touches the network or storage — the
//! session gateway fans out the deltas, the persistence bridge folds
//! snapshots to disk.

pub mod op;
pub mod text;

pub use op::{CrdtError, Op, OpId, Update};
pub use text::{ApplyOutcome, TextDoc};
