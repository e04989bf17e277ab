//! Room registry: the single authority for which documents are live.
//!
//! Every connection for a given document id resolves to the same
//! [`Room`] instance through [`RoomRegistry::hydrate`]. Rooms are
//! created on first demand by loading the persisted snapshot (or
//! starting empty when no snapshot exists), kept while sessions are
//! attached, and persisted-then-evicted when the last session leaves.
//!
//! Flushing is debounced: edits only mark the room dirty, and a
//! background cycle driven by the server walks dirty rooms on an
//! interval. Any number of edits between two ticks costs one store
//! write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::crdt::TextDoc;
use crate::presence::PresencePeer;
use crate::room::{Room, RoomError};
use crate::storage::{SnapshotStore, StoreError};

/// Tunables for room lifecycle and fan-out.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between background flush cycles.
    pub flush_interval: Duration,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
    /// Maximum concurrent sessions per room.
    pub max_sessions_per_room: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3),
            broadcast_capacity: 256,
            max_sessions_per_room: 64,
        }
    }
}

/// Owns the live rooms and the snapshot store behind them.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    store: Arc<dyn SnapshotStore>,
    config: RegistryConfig,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: RegistryConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Get the live room for a document, loading it from the store on
    /// first access. A missing snapshot starts an empty document; a
    /// snapshot that fails to load is logged and also starts empty
    /// rather than refusing the session.
    pub async fn hydrate(&self, doc_id: Uuid) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        self.hydrate_locked(&mut rooms, doc_id)
    }

    /// Hydrate (or attach a session to) a room while both the map lock
    /// and the room are held, so [`RoomRegistry::release`] cannot evict
    /// the room between lookup and join. Sessions must attach through
    /// here, never through a previously fetched [`Room`] handle.
    pub async fn join(
        &self,
        doc_id: Uuid,
        connection_id: Uuid,
        peer: PresencePeer,
    ) -> Result<
        (
            Arc<Room>,
            broadcast::Receiver<Arc<Vec<u8>>>,
            Vec<PresencePeer>,
        ),
        RoomError,
    > {
        let mut rooms = self.rooms.write().await;
        let room = self.hydrate_locked(&mut rooms, doc_id);
        let (rx, roster) = room.join(connection_id, peer).await?;
        Ok((room, rx, roster))
    }

    fn hydrate_locked(&self, rooms: &mut HashMap<Uuid, Arc<Room>>, doc_id: Uuid) -> Arc<Room> {
        // Another task may have hydrated while we waited for the lock.
        if let Some(room) = rooms.get(&doc_id) {
            return room.clone();
        }

        let snapshot = match self.store.load_snapshot(doc_id) {
            Ok(blob) => blob,
            Err(e) => {
                log::error!("Failed to load snapshot for {doc_id}: {e}, starting empty");
                None
            }
        };

        // The server replica gets a random site id so its own edits
        // (restores, rewrites) never collide with client sites.
        let site = Uuid::new_v4().as_u64_pair().1;
        let doc = TextDoc::load(site, snapshot.as_deref());

        let room = Arc::new(Room::new(
            doc_id,
            doc,
            self.config.broadcast_capacity,
            self.config.max_sessions_per_room,
        ));
        rooms.insert(doc_id, room.clone());
        log::info!("Hydrated room {doc_id} ({} rooms live)", rooms.len());
        room
    }

    /// Look up a room without creating it.
    pub async fn get(&self, doc_id: Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(&doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Persist one room's current state unconditionally.
    pub async fn flush(&self, room: &Room) -> Result<(), StoreError> {
        let state = room
            .snapshot()
            .await
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.store.save_snapshot(room.doc_id(), &state)
    }

    /// One debounce cycle: persist every room that changed since the
    /// last cycle. A room whose flush fails is re-marked dirty so the
    /// next cycle retries it.
    pub async fn flush_dirty(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut flushed = 0;

        for room in rooms {
            if !room.take_dirty() {
                continue;
            }
            match self.flush(&room).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    log::error!("Flush failed for {}: {e}", room.doc_id());
                    room.mark_dirty();
                }
            }
        }

        flushed
    }

    /// Persist every live room regardless of dirtiness. Used on
    /// shutdown.
    pub async fn flush_all(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut flushed = 0;

        for room in rooms {
            room.take_dirty();
            match self.flush(&room).await {
                Ok(()) => flushed += 1,
                Err(e) => log::error!("Shutdown flush failed for {}: {e}", room.doc_id()),
            }
        }

        flushed
    }

    /// Evict a room if it has no attached sessions, persisting its
    /// state first. The occupancy check runs under the map write lock,
    /// and joins go through [`RoomRegistry::join`] under the same lock,
    /// so a session can never slip in between the check and the
    /// removal.
    pub async fn release(&self, doc_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&doc_id).cloned() else {
            return;
        };
        if room.session_count().await > 0 {
            return;
        }

        room.take_dirty();
        if let Err(e) = self.flush(&room).await {
            // Keep the room live so its state stays reachable and the
            // flusher retries.
            log::error!("Eviction flush failed for {doc_id}: {e}, keeping room");
            room.mark_dirty();
            return;
        }

        rooms.remove(&doc_id);
        log::info!("Evicted idle room {doc_id} ({} rooms live)", rooms.len());
    }

    /// Advance the document's persistent revision counter.
    pub fn bump(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        self.store.bump_revision(doc_id)
    }
}
