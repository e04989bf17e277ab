//! In-memory snapshot store for development and tests.
//!
//! Same contract as the durable store, no durability. Selecting it is
//! an explicit configuration choice and the server logs a warning at
//! startup so non-durable production runs are never accidental.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use super::{SnapshotStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<Uuid, Vec<u8>>>,
    revisions: Mutex<HashMap<Uuid, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(snapshots.get(&doc_id).cloned())
    }

    fn save_snapshot(&self, doc_id: Uuid, state: &[u8]) -> Result<(), StoreError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        snapshots.insert(doc_id, state.to_vec());
        Ok(())
    }

    fn bump_revision(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let mut revisions = self
            .revisions
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let rev = revisions.entry(doc_id).or_insert(0);
        *rev += 1;
        Ok(*rev)
    }

    fn revision(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let revisions = self
            .revisions
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(revisions.get(&doc_id).copied().unwrap_or(0))
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(snapshots.keys().copied().collect())
    }
}
