//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── TextDoc ── broadcast channel
//! Client B ──┘        │
//!                      ├── RoomRegistry ── SnapshotStore (RocksDB / memory)
//!                      │
//!                      └── Directory (authorization oracle)
//! ```
//!
//! A connection goes through three phases:
//! 1. Handshake — the JWT from the `token` query parameter is verified
//!    before the WebSocket upgrade; a missing or invalid token rejects
//!    the upgrade with HTTP 401, a malformed document path with 400.
//! 2. Authorization — after the upgrade, the directory is consulted.
//!    Administrators may join any live (non-deleted) document; other
//!    users need owner or collaborator access. A denied session gets a
//!    `Forbidden` frame and a close, never a join.
//! 3. Joined — the session receives the document snapshot and the
//!    roster, then exchanges updates until disconnect.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::{verify_token, Claims, Role};
use crate::crdt::TextDoc;
use crate::directory::Directory;
use crate::presence::PresencePeer;
use crate::protocol::{MessageKind, WireMessage};
use crate::registry::{RegistryConfig, RoomRegistry};
use crate::room::RoomError;
use crate::storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Secret used to verify session tokens
    pub jwt_secret: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum sessions per room
    pub max_sessions_per_room: usize,
    /// Seconds between debounced flush cycles
    pub flush_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            jwt_secret: "change-me".to_string(),
            storage_path: None,
            broadcast_capacity: 256,
            max_sessions_per_room: 64,
            flush_interval_secs: 3,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub denied_sessions: u64,
    pub flushed_snapshots: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    directory: Arc<dyn Directory>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server. Opens the durable store when a
    /// storage path is configured, otherwise falls back to an
    /// in-memory store that loses state on restart.
    pub fn new(config: ServerConfig, directory: Arc<dyn Directory>) -> Result<Self, StoreError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksStore::open(store_config)?)
            }
            None => {
                log::warn!("No storage path configured; documents will not survive restart");
                Arc::new(MemoryStore::new())
            }
        };

        let registry = Arc::new(RoomRegistry::new(
            store,
            RegistryConfig {
                flush_interval: Duration::from_secs(config.flush_interval_secs),
                broadcast_capacity: config.broadcast_capacity,
                max_sessions_per_room: config.max_sessions_per_room,
            },
        ));

        Ok(Self {
            config,
            registry,
            directory,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, std::io::Error> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve. This runs the server event loop forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections on an already-bound listener, driving the
    /// background flush cycle alongside the accept loop.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let flusher_registry = self.registry.clone();
        let flusher_stats = self.stats.clone();
        let flush_interval = self.registry.config().flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let flushed = flusher_registry.flush_dirty().await;
                if flushed > 0 {
                    log::debug!("Flush cycle persisted {flushed} documents");
                    flusher_stats.write().await.flushed_snapshots += flushed as u64;
                }
            }
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let directory = self.directory.clone();
            let stats = self.stats.clone();
            let secret = self.config.jwt_secret.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, directory, stats, secret).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection through handshake,
    /// authorization, and the joined message loop.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        directory: Arc<dyn Directory>,
        stats: Arc<RwLock<ServerStats>>,
        secret: String,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Filled in by the handshake callback on success.
        let mut handshake: Option<(Uuid, Claims)> = None;

        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let uri = req.uri();
            let doc_id = uri
                .path()
                .trim_start_matches('/')
                .parse::<Uuid>()
                .map_err(|_| reject(StatusCode::BAD_REQUEST))?;
            let token = uri
                .query()
                .and_then(query_token)
                .ok_or_else(|| reject(StatusCode::UNAUTHORIZED))?;
            let claims =
                verify_token(&secret, token).map_err(|_| reject(StatusCode::UNAUTHORIZED))?;
            handshake = Some((doc_id, claims));
            Ok(resp)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                log::info!("Handshake rejected from {addr}: {e}");
                stats.write().await.denied_sessions += 1;
                return Ok(());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (doc_id, claims) = handshake.ok_or("handshake state missing after upgrade")?;
        log::info!(
            "WebSocket connection established from {addr} (user {}, doc {doc_id})",
            claims.sub
        );

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Authorization: administrators may enter any live document,
        // everyone else needs directory-granted access.
        let allowed = match claims.role {
            Role::Admin => directory.document_exists(doc_id).await,
            Role::User => directory.authorize(claims.sub, doc_id).await.allows_join(),
        };

        if !allowed {
            log::warn!("User {} denied access to doc {doc_id}", claims.sub);
            let denied = WireMessage::forbidden(doc_id).encode()?;
            ws_sender.send(Message::Binary(denied.into())).await?;
            let _ = ws_sender.close().await;

            let mut s = stats.write().await;
            s.denied_sessions += 1;
            s.active_connections -= 1;
            return Ok(());
        }

        // Joined: attach to the room and seed the client. The join goes
        // through the registry so it cannot race an eviction of the
        // same room.
        let connection_id = Uuid::new_v4();
        let peer = PresencePeer::new(claims.sub, claims.username.clone());

        let (room, mut broadcast_rx, roster_members) = match registry
            .join(doc_id, connection_id, peer.clone())
            .await
        {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Join refused for doc {doc_id}: {e}");
                let denied = WireMessage::forbidden(doc_id).encode()?;
                ws_sender.send(Message::Binary(denied.into())).await?;
                let _ = ws_sender.close().await;

                let mut s = stats.write().await;
                s.denied_sessions += 1;
                s.active_connections -= 1;
                return Ok(());
            }
        };

        // From here on the session has a roster entry, so every exit
        // path must fall through to the cleanup below. The seed frames
        // and the relay loop run inside one block to guarantee that a
        // socket failure anywhere cannot return early past it.
        let session_result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            // Current state first, then who is here.
            let snapshot = room.snapshot().await?;
            let sync = WireMessage::sync_response(doc_id, snapshot).encode()?;
            ws_sender.send(Message::Binary(sync.into())).await?;

            let roster = WireMessage::roster(doc_id, &roster_members).encode()?;
            ws_sender.send(Message::Binary(roster.into())).await?;

            let joined = WireMessage::user_joined(connection_id, doc_id, &peer).encode()?;
            room.broadcast_raw(Arc::new(joined));

            {
                let mut s = stats.write().await;
                s.active_rooms = registry.room_count().await;
            }
            log::info!("{} ({}) joined doc {doc_id}", claims.username, claims.sub);

            // The sender id this client stamps on its frames. The relay
            // uses it to avoid echoing a session's own messages back.
            let mut claimed_sender: Option<Uuid> = None;

            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let wire = match WireMessage::decode(&bytes) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };

                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                if !wire.sender.is_nil() {
                                    claimed_sender = Some(wire.sender);
                                }

                                match wire.kind {
                                    MessageKind::Update => {
                                        match room.apply_update(&wire.payload).await {
                                            Ok(outcome) => {
                                                if outcome.applied > 0 {
                                                    if let Err(e) = registry.bump(doc_id) {
                                                        log::error!(
                                                            "Revision bump failed for {doc_id}: {e}"
                                                        );
                                                    }
                                                }
                                                if outcome.deferred > 0 {
                                                    log::debug!(
                                                        "Buffered {} ops awaiting dependencies \
                                                         for doc {doc_id}",
                                                        outcome.deferred
                                                    );
                                                }
                                                // Forward the frame verbatim. Frames
                                                // that only deferred go out too:
                                                // peers need those bytes once their
                                                // missing anchors arrive.
                                                if outcome.applied > 0 || outcome.deferred > 0 {
                                                    room.broadcast_raw(Arc::new(bytes));
                                                }
                                            }
                                            Err(e) => {
                                                log::warn!(
                                                    "Rejected malformed update from {addr}: {e}"
                                                );
                                            }
                                        }
                                    }

                                    MessageKind::SyncRequest => {
                                        let snapshot = room.snapshot().await?;
                                        let response =
                                            WireMessage::sync_response(doc_id, snapshot).encode()?;
                                        ws_sender.send(Message::Binary(response.into())).await?;
                                    }

                                    MessageKind::Awareness => {
                                        // Ephemeral: relayed, never persisted.
                                        room.broadcast_raw(Arc::new(bytes));
                                    }

                                    MessageKind::Ping => {
                                        let pong = WireMessage::pong(connection_id).encode()?;
                                        ws_sender.send(Message::Binary(pong.into())).await?;
                                    }

                                    other => {
                                        log::debug!("Unhandled message kind from {addr}: {other:?}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing broadcast message
                    msg = broadcast_rx.recv() => {
                        match msg {
                            Ok(data) => {
                                // Don't echo a session's own messages back:
                                // match either the server-assigned id or the
                                // id the client stamps on its frames.
                                if let Ok(wire) = WireMessage::decode(&data) {
                                    if wire.sender == connection_id
                                        || Some(wire.sender) == claimed_sender
                                    {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Session {connection_id} lagged by {n} messages");
                            }
                            Err(_) => break,
                        }
                    }
                }
            }

            Ok(())
        }
        .await;

        if let Err(e) = session_result {
            log::info!("Session {connection_id} on doc {doc_id} ended early: {e}");
        }

        // Cleanup: detach, announce, and evict the room if idle.
        if let Some(departed) = room.leave(connection_id).await {
            match WireMessage::user_left(connection_id, doc_id, &departed).encode() {
                Ok(left) => {
                    room.broadcast_raw(Arc::new(left));
                }
                Err(e) => log::error!("Failed to encode leave broadcast for {doc_id}: {e}"),
            }
            log::info!("{} left doc {doc_id}", departed.username);
        }

        if room.session_count().await == 0 {
            registry.release(doc_id).await;
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = registry.room_count().await;
        }

        Ok(())
    }

    /// Capture the document's current state as a named version in the
    /// directory. Returns the version id.
    pub async fn capture_version(
        &self,
        doc_id: Uuid,
        name: impl Into<String>,
        author: Uuid,
    ) -> Result<Uuid, RoomError> {
        let room = self.registry.hydrate(doc_id).await;
        let state = room.snapshot().await?;
        let version_id = self
            .directory
            .record_named_snapshot(doc_id, state, name.into(), author)
            .await;
        Ok(version_id)
    }

    /// Restore a document to a previously captured state. The restore
    /// flows through the merge path as a regular update, so attached
    /// sessions converge on it live. State bytes that fail to decode
    /// are refused outright; the live document is left untouched.
    pub async fn restore_document(&self, doc_id: Uuid, state: &[u8]) -> Result<(), RoomError> {
        let text = TextDoc::try_load(0, state)?.text();
        let room = self.registry.hydrate(doc_id).await;
        let update = room.replace_all(&text).await?;
        if update.is_empty() {
            return Ok(());
        }

        match WireMessage::update(Uuid::nil(), doc_id, update.encode()?).encode() {
            Ok(frame) => {
                room.broadcast_raw(Arc::new(frame));
            }
            Err(e) => log::error!("Failed to encode restore broadcast for {doc_id}: {e}"),
        }
        if let Err(e) = self.registry.bump(doc_id) {
            log::error!("Revision bump failed for {doc_id}: {e}");
        }
        Ok(())
    }

    /// Persist every live room. Called on graceful shutdown.
    pub async fn flush_all(&self) -> usize {
        self.registry.flush_all().await
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the authorization directory.
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut resp = ErrorResponse::new(None);
    *resp.status_mut() = status;
    resp
}

fn query_token(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| pair.strip_prefix("token="))
}
