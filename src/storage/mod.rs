//! Durable storage port for document snapshots and revision counters.
//!
//! ```text
//! ┌──────────────┐   folded snapshot    ┌───────────────┐
//! │ RoomRegistry │ ───────────────────► │ SnapshotStore │
//! │ (in-memory)  │ ◄─────────────────── │ (port)        │
//! └──────────────┘   hydrate on join    └───────┬───────┘
//!                                        ┌──────┴──────┐
//!                                        ▼             ▼
//!                                  RocksStore     MemoryStore
//!                                  (durable)      (dev/tests)
//! ```
//!
//! One blob per document key, overwritten on every flush — no append
//! log. The revision counter lives under a separate key and only ever
//! moves forward. The implementation is chosen at construction time:
//! running on [`MemoryStore`] is an explicit, logged decision, never a
//! silent fallback.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use uuid::Uuid;

/// Pluggable persistence port consumed by the persistence bridge.
pub trait SnapshotStore: Send + Sync {
    /// Read a document's snapshot blob. `Ok(None)` means the document
    /// has never been persisted.
    fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the document's snapshot blob.
    fn save_snapshot(&self, doc_id: Uuid, state: &[u8]) -> Result<(), StoreError>;

    /// Atomically increment and return the document's revision.
    fn bump_revision(&self, doc_id: Uuid) -> Result<u64, StoreError>;

    /// Current revision without incrementing (0 = never bumped).
    fn revision(&self, doc_id: Uuid) -> Result<u64, StoreError>;

    /// Ids of all persisted documents.
    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Storage errors. Never surfaced to editing clients; the bridge logs
/// and retries on the next flush window.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure.
    Database(String),
    /// Snapshot blob failed to decompress.
    Compression(String),
    /// Stored bytes had an impossible shape.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
            StoreError::Corrupt(e) => write!(f, "Corrupt store entry: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
