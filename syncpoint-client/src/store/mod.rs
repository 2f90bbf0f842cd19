//! Document store abstraction for Syncpoint.
//!
//! The client never talks to the server directly: it reads and writes
//! documents in local databases and asks the store to replicate them.
//!
//! # Design
//!
//! The store trait is async and database-oriented:
//! - `get()`/`put()`/`delete()`/`query()` work on one local database
//! - `changes()` subscribes to per-document change notifications
//! - `start_replication()` begins a replication and hands back its event stream
//! - `stop_replication()` ends one
//!
//! [`MemoryStore`] keeps everything in memory and lets tests drive
//! replication by hand; [`ServerSimulator`] answers replications the way a
//! Syncpoint server would.

mod memory;
mod simulator;

pub use memory::MemoryStore;
pub use simulator::{ServerSimulator, SimulatorHandle, SESSION_FILTER};

use async_trait::async_trait;
use syncpoint_types::{
    ChangeEvent, DatabaseName, DocId, Document, ReplicationEvent, ReplicationId, ReplicationSpec,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The database does not exist.
    #[error("database not found: {0}")]
    DatabaseNotFound(DatabaseName),

    /// The replication id is unknown (never started, or already stopped).
    #[error("unknown replication: {0}")]
    UnknownReplication(ReplicationId),

    /// The store refused to start a replication.
    #[error("replication failed: {0}")]
    ReplicationFailed(String),

    /// Any other storage failure.
    #[error("storage failure: {0}")]
    Backend(String),
}

/// Predicate used by [`DocumentStore::query`].
pub type DocumentFilter<'a> = &'a (dyn Fn(&Document) -> bool + Send + Sync);

/// A running replication.
#[derive(Debug)]
pub struct ReplicationHandle {
    /// Store-assigned id, used to stop it.
    pub id: ReplicationId,
    /// Progress events. Closed when the replication stops.
    pub events: mpsc::UnboundedReceiver<ReplicationEvent>,
}

/// Document store trait.
///
/// Implementations wrap a concrete local database engine and its
/// replicator.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Create a database. Creating one that exists is not an error.
    async fn create_database(&self, db: &DatabaseName) -> Result<(), StoreError>;

    /// Fetch a document.
    async fn get(&self, db: &DatabaseName, id: &DocId) -> Result<Option<Document>, StoreError>;

    /// Create or replace a document.
    async fn put(&self, db: &DatabaseName, doc: Document) -> Result<(), StoreError>;

    /// Delete a document. Returns whether it existed.
    async fn delete(&self, db: &DatabaseName, id: &DocId) -> Result<bool, StoreError>;

    /// All documents matching `filter`, ordered by id.
    async fn query(
        &self,
        db: &DatabaseName,
        filter: DocumentFilter<'_>,
    ) -> Result<Vec<Document>, StoreError>;

    /// Subscribe to change notifications for a database.
    async fn changes(&self, db: &DatabaseName)
        -> Result<broadcast::Receiver<ChangeEvent>, StoreError>;

    /// Start a replication.
    async fn start_replication(&self, spec: ReplicationSpec)
        -> Result<ReplicationHandle, StoreError>;

    /// Stop a replication. Its event stream closes.
    async fn stop_replication(&self, id: ReplicationId) -> Result<(), StoreError>;
}
