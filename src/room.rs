//! A live editing room: one shared document plus the sessions
//! currently attached to it.
//!
//! The room owns the authoritative [`TextDoc`] replica, a broadcast
//! channel that fans updates out to every attached session, and the
//! presence roster. A dirty flag records whether the replica has
//! changed since the last flush so the registry's background flusher
//! only touches documents that moved.
//!
//! Broadcast payloads are `Arc<Vec<u8>>` so a message serialized once
//! is shared by all receivers without copying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::crdt::{ApplyOutcome, CrdtError, TextDoc, Update};
use crate::presence::{PresencePeer, PresenceRoster};

/// Error returned by room operations.
#[derive(Debug)]
pub enum RoomError {
    /// The room has reached its session capacity.
    RoomFull { max_sessions: usize },
    /// The update or snapshot could not be processed.
    Crdt(CrdtError),
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::RoomFull { max_sessions } => {
                write!(f, "Room is full (max {max_sessions} sessions)")
            }
            RoomError::Crdt(e) => write!(f, "Document error: {e}"),
        }
    }
}

impl std::error::Error for RoomError {}

impl From<CrdtError> for RoomError {
    fn from(e: CrdtError) -> Self {
        RoomError::Crdt(e)
    }
}

/// A single document's live state and attached sessions.
pub struct Room {
    doc_id: Uuid,
    doc: Mutex<TextDoc>,
    dirty: AtomicBool,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    sessions: RwLock<PresenceRoster>,
    max_sessions: usize,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("doc_id", &self.doc_id)
            .field("max_sessions", &self.max_sessions)
            .finish_non_exhaustive()
    }
}

impl Room {
    pub fn new(
        doc_id: Uuid,
        doc: TextDoc,
        broadcast_capacity: usize,
        max_sessions: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(broadcast_capacity);
        Self {
            doc_id,
            doc: Mutex::new(doc),
            dirty: AtomicBool::new(false),
            sender,
            sessions: RwLock::new(PresenceRoster::new()),
            max_sessions,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Attach a session. Returns a broadcast receiver for the room's
    /// message stream and the roster including the newcomer.
    pub async fn join(
        &self,
        connection_id: Uuid,
        peer: PresencePeer,
    ) -> Result<(broadcast::Receiver<Arc<Vec<u8>>>, Vec<PresencePeer>), RoomError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(RoomError::RoomFull {
                max_sessions: self.max_sessions,
            });
        }
        let roster = sessions.join(connection_id, peer);
        Ok((self.sender.subscribe(), roster))
    }

    /// Detach a session. Returns the departed peer, if it was attached.
    pub async fn leave(&self, connection_id: Uuid) -> Option<PresencePeer> {
        self.sessions.write().await.leave(connection_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn roster(&self) -> Vec<PresencePeer> {
        self.sessions.read().await.roster()
    }

    /// Merge a remote update into the replica. Marks the room dirty
    /// when the update changed anything.
    pub async fn apply_update(&self, bytes: &[u8]) -> Result<ApplyOutcome, RoomError> {
        let mut doc = self.doc.lock().await;
        let outcome = doc.apply_update(bytes)?;
        if outcome.applied > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(outcome)
    }

    /// Replace the entire document content, returning the update that
    /// encodes the change so it can be broadcast to attached sessions.
    pub async fn replace_all(&self, text: &str) -> Result<Update, RoomError> {
        let mut doc = self.doc.lock().await;
        let update = doc.replace_all(text);
        if !update.is_empty() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(update)
    }

    /// Encode the current replica state for sync responses and flushes.
    pub async fn snapshot(&self) -> Result<Vec<u8>, RoomError> {
        let doc = self.doc.lock().await;
        Ok(doc.encode_snapshot()?)
    }

    pub async fn text(&self) -> String {
        self.doc.lock().await.text()
    }

    pub async fn visible_len(&self) -> usize {
        self.doc.lock().await.visible_len()
    }

    /// Fan a pre-serialized message out to every attached session.
    /// Returns the number of receivers the message reached.
    pub fn broadcast_raw(&self, payload: Arc<Vec<u8>>) -> usize {
        // Send fails only when no receiver is subscribed, which is
        // fine: the message simply had no audience.
        self.sender.send(payload).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Clear and return the dirty flag. The caller owns flushing the
    /// state it snapshots; on failure it should call [`mark_dirty`]
    /// so the next flush cycle retries.
    ///
    /// [`mark_dirty`]: Room::mark_dirty
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}
