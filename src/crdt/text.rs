//! Replicated text state: an RGA-style sequence CRDT.
//!
//! Structure:
//! ```text
//! (head)
//!   ├── item "w" (1@B) ── item "o" (2@B) ── …       newer sibling first
//!   └── item "h" (1@A) ── item "e" (2@A) ── …
//! ```
//!
//! Every character is an item anchored to the item it was typed after
//! (its `origin`). Items with the same origin are siblings ordered
//! descending by [`OpId`], and the document reads as a depth-first
//! flatten of the forest. Deletions tombstone items in place so
//! concurrent ops that reference them still resolve.
//!
//! Merge guarantees:
//! - **Commutative** — any permutation of the same update multiset
//!   yields the same text (sibling order is a pure function of ids;
//!   ops with missing dependencies wait in a pending set).
//! - **Idempotent** — re-delivered inserts are dropped by id, deletes
//!   re-tombstone harmlessly.
//!
//! One mutator at a time: callers serialize access per document (the
//! room holds each resident doc behind a mutex).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::op::{CrdtError, Op, OpId, Update};

/// Upper bound on buffered ops whose dependencies have not arrived.
/// Dependencies that never arrive must not grow the replica without
/// bound; past the cap the oldest entry is shed.
const MAX_PENDING_OPS: usize = 8192;

/// One character of replicated state, tombstoned on delete.
#[derive(Debug, Clone)]
struct Item {
    id: OpId,
    ch: char,
    deleted: bool,
    /// Index of the item this one is anchored to (`None` = head).
    parent: Option<usize>,
    /// Indices of items anchored to this one, descending by id.
    children: Vec<usize>,
}

/// Snapshot wire form: items in document order (parents precede
/// children), sufficient to rebuild the forest without history replay.
#[derive(Debug, Serialize, Deserialize)]
struct SnapItem {
    id: OpId,
    origin: Option<OpId>,
    ch: char,
    deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    items: Vec<SnapItem>,
}

/// Result of applying a batch of ops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Ops that changed state. Idempotent re-deliveries do not count.
    pub applied: usize,
    /// Ops still waiting on a missing dependency.
    pub deferred: usize,
}

enum Integrated {
    Fresh,
    Duplicate,
    Deferred,
}

/// A mutable, mergeable text replica.
pub struct TextDoc {
    site: u64,
    clock: u64,
    items: Vec<Item>,
    /// Item id → index into `items`.
    index: HashMap<OpId, usize>,
    /// Head-anchored items, descending by id.
    roots: Vec<usize>,
    /// Ops whose origin/target has not arrived yet.
    pending: Vec<Op>,
}

impl TextDoc {
    /// Create an empty replica for the given site.
    pub fn new(site: u64) -> Self {
        Self {
            site,
            clock: 0,
            items: Vec::new(),
            index: HashMap::new(),
            roots: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Construct a replica, optionally seeded from snapshot bytes.
    ///
    /// A corrupt snapshot falls back to an empty document — durable
    /// corruption must never make a document uneditable.
    pub fn load(site: u64, snapshot: Option<&[u8]>) -> Self {
        let mut doc = Self::new(site);
        if let Some(bytes) = snapshot {
            match Self::try_load(site, bytes) {
                Ok(seeded) => doc = seeded,
                Err(e) => {
                    log::warn!("corrupt snapshot ({e}); starting from empty document");
                }
            }
        }
        doc
    }

    /// Construct a replica from snapshot bytes, refusing corrupt input.
    ///
    /// Callers that hold authoritative state (version restore) use this
    /// instead of [`TextDoc::load`]: there a decode failure must surface
    /// as an error rather than silently yield an empty document.
    pub fn try_load(site: u64, snapshot: &[u8]) -> Result<Self, CrdtError> {
        let snap = Self::decode_snapshot(snapshot)?;
        let mut doc = Self::new(site);
        doc.seed(snap);
        Ok(doc)
    }

    fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, CrdtError> {
        let (snap, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CrdtError::Decode(e.to_string()))?;
        Ok(snap)
    }

    fn seed(&mut self, snap: Snapshot) {
        for item in snap.items {
            // Parents precede children in snapshot order, so every
            // insert integrates immediately.
            self.integrate(&Op::Insert {
                id: item.id,
                origin: item.origin,
                ch: item.ch,
            });
            if item.deleted {
                self.integrate(&Op::Delete { target: item.id });
            }
        }
    }

    /// Serialize the full merged state. Loading the result reproduces
    /// identical observable text (round-trip law).
    pub fn encode_snapshot(&self) -> Result<Vec<u8>, CrdtError> {
        let items = self
            .doc_order()
            .into_iter()
            .map(|i| {
                let item = &self.items[i];
                SnapItem {
                    id: item.id,
                    origin: self.origin_of(i),
                    ch: item.ch,
                    deleted: item.deleted,
                }
            })
            .collect();
        bincode::serde::encode_to_vec(&Snapshot { items }, bincode::config::standard())
            .map_err(|e| CrdtError::Encode(e.to_string()))
    }

    /// Apply a binary update delta. Malformed bytes are rejected
    /// without mutating state.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<ApplyOutcome, CrdtError> {
        let update = Update::decode(bytes)?;
        Ok(self.apply_ops(&update.ops))
    }

    /// Apply decoded ops, then retry the pending set to a fixpoint.
    pub fn apply_ops(&mut self, ops: &[Op]) -> ApplyOutcome {
        let mut applied = 0;
        for op in ops {
            match self.integrate(op) {
                Integrated::Fresh => applied += 1,
                Integrated::Duplicate => {}
                Integrated::Deferred => self.defer(*op),
            }
        }

        // A newly arrived op may unblock previously deferred ones.
        loop {
            let before = self.pending.len();
            if before == 0 {
                break;
            }
            let drained = std::mem::take(&mut self.pending);
            for op in drained {
                match self.integrate(&op) {
                    Integrated::Fresh => applied += 1,
                    Integrated::Duplicate => {}
                    Integrated::Deferred => self.defer(op),
                }
            }
            if self.pending.len() == before {
                break;
            }
        }

        ApplyOutcome {
            applied,
            deferred: self.pending.len(),
        }
    }

    fn defer(&mut self, op: Op) {
        if self.pending.len() >= MAX_PENDING_OPS {
            let dropped = self.pending.remove(0);
            log::warn!(
                "pending op limit ({MAX_PENDING_OPS}) reached on site {}; dropping {:?}",
                self.site,
                dropped.dependency(),
            );
        }
        self.pending.push(op);
    }

    fn integrate(&mut self, op: &Op) -> Integrated {
        match *op {
            Op::Insert { id, origin, ch } => {
                if self.index.contains_key(&id) {
                    return Integrated::Duplicate;
                }
                let parent = match origin {
                    None => None,
                    Some(o) => match self.index.get(&o) {
                        Some(&p) => Some(p),
                        None => return Integrated::Deferred,
                    },
                };

                // Siblings are kept descending by id; the slot is where
                // the first smaller id starts.
                let slot = {
                    let siblings = match parent {
                        None => &self.roots,
                        Some(p) => &self.items[p].children,
                    };
                    siblings.partition_point(|&i| self.items[i].id > id)
                };

                let idx = self.items.len();
                self.items.push(Item {
                    id,
                    ch,
                    deleted: false,
                    parent,
                    children: Vec::new(),
                });
                match parent {
                    None => self.roots.insert(slot, idx),
                    Some(p) => self.items[p].children.insert(slot, idx),
                }
                self.index.insert(id, idx);
                self.clock = self.clock.max(id.clock + 1);
                Integrated::Fresh
            }
            Op::Delete { target } => match self.index.get(&target) {
                Some(&i) if self.items[i].deleted => Integrated::Duplicate,
                Some(&i) => {
                    self.items[i].deleted = true;
                    Integrated::Fresh
                }
                None => Integrated::Deferred,
            },
        }
    }

    // ─── Local edit producers ─────────────────────────────────────────
    //
    // Each returns the ops to broadcast; application happens locally
    // through the same integrate path as remote deltas.

    /// Insert `text` at visible position `pos` (clamped to the end).
    pub fn insert(&mut self, pos: usize, text: &str) -> Update {
        let pos = pos.min(self.visible_len());
        let mut origin = if pos == 0 {
            None
        } else {
            self.visible_id_at(pos - 1)
        };

        let mut ops = Vec::with_capacity(text.chars().count());
        for ch in text.chars() {
            let id = OpId::new(self.clock, self.site);
            let op = Op::Insert { id, origin, ch };
            self.integrate(&op);
            ops.push(op);
            origin = Some(id);
        }
        Update::new(ops)
    }

    /// Tombstone `len` visible characters starting at `pos`.
    pub fn delete(&mut self, pos: usize, len: usize) -> Update {
        let targets: Vec<OpId> = self
            .doc_order()
            .into_iter()
            .filter(|&i| !self.items[i].deleted)
            .skip(pos)
            .take(len)
            .map(|i| self.items[i].id)
            .collect();

        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            let op = Op::Delete { target };
            self.integrate(&op);
            ops.push(op);
        }
        Update::new(ops)
    }

    /// Replace the whole content: delete-all then insert, expressed as
    /// ordinary ops so it merges with concurrent edits instead of
    /// overwriting them.
    pub fn replace_all(&mut self, text: &str) -> Update {
        let mut ops = self.delete(0, self.visible_len()).ops;
        ops.extend(self.insert(0, text).ops);
        Update::new(ops)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// The flattened, tombstone-free text.
    pub fn text(&self) -> String {
        self.doc_order()
            .into_iter()
            .filter(|&i| !self.items[i].deleted)
            .map(|i| self.items[i].ch)
            .collect()
    }

    /// Number of visible (non-tombstoned) characters.
    pub fn visible_len(&self) -> usize {
        self.items.iter().filter(|it| !it.deleted).count()
    }

    /// Total items including tombstones.
    pub fn total_items(&self) -> usize {
        self.items.len()
    }

    /// Ops still waiting on missing dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn site(&self) -> u64 {
        self.site
    }

    // ─── Internals ────────────────────────────────────────────────────

    /// Item indices in document order (depth-first flatten).
    fn doc_order(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.items.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(i) = stack.pop() {
            out.push(i);
            for &c in self.items[i].children.iter().rev() {
                stack.push(c);
            }
        }
        out
    }

    fn visible_id_at(&self, idx: usize) -> Option<OpId> {
        self.doc_order()
            .into_iter()
            .filter(|&i| !self.items[i].deleted)
            .nth(idx)
            .map(|i| self.items[i].id)
    }

    fn origin_of(&self, idx: usize) -> Option<OpId> {
        self.items[idx].parent.map(|p| self.items[p].id)
    }
}
