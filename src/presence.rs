//! Per-room ephemeral presence.
//!
//! Pure derived state: who is connected to a room right now. Nothing
//! here is persisted — a process restart simply starts with an empty
//! roster, reconstructed as sessions rejoin.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One connected member, as peers see them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePeer {
    pub user_id: Uuid,
    pub username: String,
}

impl PresencePeer {
    pub fn new(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// The member set of one room, keyed by connection id.
///
/// A user editing from two tabs appears twice — each connection is a
/// distinct session, matching what the roster broadcast reports.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    members: HashMap<Uuid, PresencePeer>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session; returns the roster including the newcomer.
    pub fn join(&mut self, connection_id: Uuid, peer: PresencePeer) -> Vec<PresencePeer> {
        self.members.insert(connection_id, peer);
        self.roster()
    }

    /// Remove a session; returns the departed peer if it was present.
    pub fn leave(&mut self, connection_id: Uuid) -> Option<PresencePeer> {
        self.members.remove(&connection_id)
    }

    /// Recompute the full member list.
    pub fn roster(&self) -> Vec<PresencePeer> {
        let mut peers: Vec<PresencePeer> = self.members.values().cloned().collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id).then(a.username.cmp(&b.username)));
        peers
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains_user(&self, user_id: Uuid) -> bool {
        self.members.values().any(|p| p.user_id == user_id)
    }
}
