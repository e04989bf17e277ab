//! Operation identifiers and the binary update codec.
//!
//! Every edit is a tagged op carrying a globally unique [`OpId`]:
//! a Lamport clock paired with the originating site. The total order
//! over `(clock, site)` is what makes concurrent-insert tie-breaks
//! deterministic across replicas.

use serde::{Deserialize, Serialize};

/// Globally unique operation identifier.
///
/// Ordered by `(clock, site)` — the derived lexicographic order is the
/// tie-break rule for concurrent inserts at the same position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpId {
    /// Lamport clock at the originating site.
    pub clock: u64,
    /// Site (replica) identifier.
    pub site: u64,
}

impl OpId {
    pub fn new(clock: u64, site: u64) -> Self {
        Self { clock, site }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.clock, self.site)
    }
}

/// A single atomic edit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Insert `ch` immediately after `origin` (`None` = document head).
    Insert {
        id: OpId,
        origin: Option<OpId>,
        ch: char,
    },
    /// Tombstone the item identified by `target`. The item is retained
    /// so concurrent ops referencing it still order correctly.
    Delete { target: OpId },
}

impl Op {
    /// The id this op depends on being present before it can integrate.
    pub fn dependency(&self) -> Option<OpId> {
        match self {
            Op::Insert { origin, .. } => *origin,
            Op::Delete { target } => Some(*target),
        }
    }
}

/// One client transaction's worth of ops.
///
/// Opaque bytes on the wire; immutable once created. A replica applies
/// an update exactly once — re-delivery is absorbed by the merge rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
}

impl Update {
    pub fn new(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Serialize to the compact binary wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CrdtError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CrdtError::Decode(e.to_string()))?;
        Ok(update)
    }
}

/// CRDT-layer errors. Decode failures never mutate replica state.
#[derive(Debug, Clone)]
pub enum CrdtError {
    /// Malformed update or snapshot bytes.
    Decode(String),
    /// Serialization failed.
    Encode(String),
}

impl std::fmt::Display for CrdtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrdtError::Decode(e) => write!(f, "Decode error: {e}"),
            CrdtError::Encode(e) => write!(f, "Encode error: {e}"),
        }
    }
}

impl std::error::Error for CrdtError {}
