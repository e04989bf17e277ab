//! # cowrite
//!
//! Real-time collaborative text synchronization engine.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      SyncServer                        │
//! │  handshake (JWT) → authorize (Directory) → joined      │
//! ├────────────────────────────────────────────────────────┤
//! │ RoomRegistry                                           │
//! │   └── Room ── TextDoc (sequence CRDT)                  │
//! │        ├── broadcast channel (fan-out)                 │
//! │        └── PresenceRoster                              │
//! ├────────────────────────────────────────────────────────┤
//! │ SnapshotStore                                          │
//! │   ├── RocksStore (LZ4 snapshots + revision counters)   │
//! │   └── MemoryStore (tests / no persistence)             │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The document replica is a tombstone-based sequence CRDT: every
//! character carries a globally unique `(clock, site)` id and an
//! anchor to the character it was typed after. Concurrent edits merge
//! deterministically on every replica regardless of delivery order,
//! so the server can apply and forward updates without coordination.
//!
//! Persistence is debounced: edits mark a room dirty and a background
//! cycle folds the replica into one snapshot blob per document. The
//! revision counter advances on every applied update, giving clients
//! a cheap "has this document changed" check.

pub mod auth;
pub mod crdt;
pub mod directory;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;

pub use auth::{create_token, verify_token, AuthError, Claims, Role};
pub use crdt::{ApplyOutcome, CrdtError, Op, OpId, TextDoc, Update};
pub use directory::{AccessLevel, Directory, MemoryDirectory, NamedSnapshot};
pub use presence::{PresencePeer, PresenceRoster};
pub use protocol::{MessageKind, ProtocolError, WireMessage};
pub use registry::{RegistryConfig, RoomRegistry};
pub use room::{Room, RoomError};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError};
