//! The external collaborator port: authorization oracle + metadata store.
//!
//! Document titles, permission records and named versions live in an
//! external metadata service; the sync engine only asks questions
//! through this trait and never mutates permission data itself.
//! [`MemoryDirectory`] is the in-process implementation used by tests
//! and development deployments.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use uuid::Uuid;

/// What a user may do with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    None,
    Read,
    Write,
    Owner,
}

impl AccessLevel {
    /// Whether this level admits the user into the document's room.
    pub fn allows_join(self) -> bool {
        self != AccessLevel::None
    }
}

/// A named, immutable capture of a document's state ("version").
#[derive(Debug, Clone, PartialEq)]
pub struct NamedSnapshot {
    pub id: Uuid,
    pub name: String,
    pub author: Uuid,
    /// Full CRDT snapshot at capture time.
    pub state: Vec<u8>,
    /// Capture timestamp (seconds since epoch).
    pub created_at: u64,
}

/// The authorization oracle and metadata store contract.
///
/// Calls may suspend (the production implementation talks to a
/// database); each session runs in its own task, so a slow oracle
/// never stalls unrelated documents.
pub trait Directory: Send + Sync {
    /// Access level of `user` for `doc_id`. Soft-deleted documents
    /// answer `None` for everyone.
    fn authorize(&self, user: Uuid, doc_id: Uuid) -> BoxFuture<'_, AccessLevel>;

    /// Whether the document exists and is not soft-deleted. This is
    /// the only check applied to administrative identities.
    fn document_exists(&self, doc_id: Uuid) -> BoxFuture<'_, bool>;

    /// Display title, if the document exists.
    fn document_title(&self, doc_id: Uuid) -> BoxFuture<'_, Option<String>>;

    /// Record a named version capture; returns the version id.
    fn record_named_snapshot(
        &self,
        doc_id: Uuid,
        state: Vec<u8>,
        name: String,
        author: Uuid,
    ) -> BoxFuture<'_, Uuid>;

    /// Ordered (oldest first) list of named versions.
    fn list_named_snapshots(&self, doc_id: Uuid) -> BoxFuture<'_, Vec<NamedSnapshot>>;
}

#[derive(Debug)]
struct DocRecord {
    title: String,
    owner: Uuid,
    collaborators: HashMap<Uuid, AccessLevel>,
    deleted: bool,
    versions: Vec<NamedSnapshot>,
}

/// In-memory directory for tests and development.
#[derive(Default)]
pub struct MemoryDirectory {
    docs: RwLock<HashMap<Uuid, DocRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document owned by `owner`; returns its id.
    pub async fn create_document(&self, owner: Uuid, title: impl Into<String>) -> Uuid {
        let doc_id = Uuid::new_v4();
        self.docs.write().await.insert(
            doc_id,
            DocRecord {
                title: title.into(),
                owner,
                collaborators: HashMap::new(),
                deleted: false,
                versions: Vec::new(),
            },
        );
        doc_id
    }

    pub async fn add_collaborator(&self, doc_id: Uuid, user: Uuid, level: AccessLevel) {
        if let Some(doc) = self.docs.write().await.get_mut(&doc_id) {
            doc.collaborators.insert(user, level);
        }
    }

    /// Soft-delete: the record stays, access drops to none.
    pub async fn mark_deleted(&self, doc_id: Uuid) {
        if let Some(doc) = self.docs.write().await.get_mut(&doc_id) {
            doc.deleted = true;
        }
    }
}

impl Directory for MemoryDirectory {
    fn authorize(&self, user: Uuid, doc_id: Uuid) -> BoxFuture<'_, AccessLevel> {
        Box::pin(async move {
            let docs = self.docs.read().await;
            match docs.get(&doc_id) {
                Some(doc) if !doc.deleted => {
                    if doc.owner == user {
                        AccessLevel::Owner
                    } else {
                        doc.collaborators
                            .get(&user)
                            .copied()
                            .unwrap_or(AccessLevel::None)
                    }
                }
                _ => AccessLevel::None,
            }
        })
    }

    fn document_exists(&self, doc_id: Uuid) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.docs
                .read()
                .await
                .get(&doc_id)
                .map(|d| !d.deleted)
                .unwrap_or(false)
        })
    }

    fn document_title(&self, doc_id: Uuid) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            self.docs
                .read()
                .await
                .get(&doc_id)
                .filter(|d| !d.deleted)
                .map(|d| d.title.clone())
        })
    }

    fn record_named_snapshot(
        &self,
        doc_id: Uuid,
        state: Vec<u8>,
        name: String,
        author: Uuid,
    ) -> BoxFuture<'_, Uuid> {
        Box::pin(async move {
            let version_id = Uuid::new_v4();
            let created_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            if let Some(doc) = self.docs.write().await.get_mut(&doc_id) {
                doc.versions.push(NamedSnapshot {
                    id: version_id,
                    name,
                    author,
                    state,
                    created_at,
                });
            }
            version_id
        })
    }

    fn list_named_snapshots(&self, doc_id: Uuid) -> BoxFuture<'_, Vec<NamedSnapshot>> {
        Box::pin(async move {
            self.docs
                .read()
                .await
                .get(&doc_id)
                .map(|d| d.versions.clone())
                .unwrap_or_default()
        })
    }
}
