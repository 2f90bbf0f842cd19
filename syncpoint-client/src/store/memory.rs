//! In-memory document store.
//!
//! Replications never move data on their own: tests (or the
//! [`ServerSimulator`](super::ServerSimulator)) complete or fail them and
//! apply inbound documents explicitly.

use super::{DocumentFilter, DocumentStore, ReplicationHandle, StoreError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use syncpoint_types::{
    ChangeEvent, DatabaseName, Direction, DocId, Document, ReplicationEvent, ReplicationId,
    ReplicationSpec,
};
use tokio::sync::{broadcast, mpsc};

/// Buffered change notifications per database.
const CHANGE_CAPACITY: usize = 256;

/// Buffered replication-start notifications.
const STARTED_CAPACITY: usize = 64;

/// In-memory store for tests and demos.
///
/// Cloning shares the same storage.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug)]
struct MemoryStoreInner {
    databases: HashMap<DatabaseName, BTreeMap<DocId, Document>>,
    watchers: HashMap<DatabaseName, broadcast::Sender<ChangeEvent>>,
    replications: BTreeMap<ReplicationId, ActiveReplication>,
    started: broadcast::Sender<(ReplicationId, ReplicationSpec)>,
    next_replication: u64,
    fail_next_put: Option<String>,
    fail_next_replication: Option<String>,
}

#[derive(Debug)]
struct ActiveReplication {
    spec: ReplicationSpec,
    events: mpsc::UnboundedSender<ReplicationEvent>,
}

impl MemoryStoreInner {
    fn database(&self, db: &DatabaseName) -> Result<&BTreeMap<DocId, Document>, StoreError> {
        self.databases
            .get(db)
            .ok_or_else(|| StoreError::DatabaseNotFound(db.clone()))
    }

    fn database_mut(
        &mut self,
        db: &DatabaseName,
    ) -> Result<&mut BTreeMap<DocId, Document>, StoreError> {
        self.databases
            .get_mut(db)
            .ok_or_else(|| StoreError::DatabaseNotFound(db.clone()))
    }

    fn watcher(&mut self, db: &DatabaseName) -> &broadcast::Sender<ChangeEvent> {
        self.watchers
            .entry(db.clone())
            .or_insert_with(|| broadcast::channel(CHANGE_CAPACITY).0)
    }

    fn notify(&self, db: &DatabaseName, doc_id: DocId, doc_type: Option<String>, deleted: bool) {
        if let Some(tx) = self.watchers.get(db) {
            // No receivers is fine
            let _ = tx.send(ChangeEvent {
                database: db.clone(),
                doc_id,
                doc_type,
                deleted,
            });
        }
    }

    fn store_doc(&mut self, db: &DatabaseName, doc: Document) -> Result<(), StoreError> {
        let id = doc.id().clone();
        let doc_type = doc.doc_type().map(str::to_string);
        self.database_mut(db)?.insert(id.clone(), doc);
        self.notify(db, id, doc_type, false);
        Ok(())
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStoreInner {
                databases: HashMap::new(),
                watchers: HashMap::new(),
                replications: BTreeMap::new(),
                started: broadcast::channel(STARTED_CAPACITY).0,
                next_replication: 1,
                fail_next_put: None,
                fail_next_replication: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to changes of `db`, even before it exists.
    pub fn watch(&self, db: &DatabaseName) -> broadcast::Receiver<ChangeEvent> {
        self.lock().watcher(db).subscribe()
    }

    /// Subscribe to replication starts.
    pub fn replication_starts(&self) -> broadcast::Receiver<(ReplicationId, ReplicationSpec)> {
        self.lock().started.subscribe()
    }

    /// Whether a database exists.
    pub fn database_exists(&self, db: &DatabaseName) -> bool {
        self.lock().databases.contains_key(db)
    }

    /// Number of documents in a database (0 if it does not exist).
    pub fn document_count(&self, db: &DatabaseName) -> usize {
        self.lock().databases.get(db).map_or(0, BTreeMap::len)
    }

    /// Read a document without going through the async trait.
    pub fn document(&self, db: &DatabaseName, id: &DocId) -> Option<Document> {
        self.lock().databases.get(db)?.get(id).cloned()
    }

    /// All running replications, ordered by id.
    pub fn active_replications(&self) -> Vec<(ReplicationId, ReplicationSpec)> {
        self.lock()
            .replications
            .iter()
            .map(|(id, r)| (*id, r.spec.clone()))
            .collect()
    }

    /// Number of running replications.
    pub fn active_replication_count(&self) -> usize {
        self.lock().replications.len()
    }

    /// The oldest running replication of `local` in `direction`.
    pub fn find_replication(&self, local: &DatabaseName, direction: Direction) -> Option<ReplicationId> {
        self.lock()
            .replications
            .iter()
            .find(|(_, r)| &r.spec.local == local && r.spec.direction == direction)
            .map(|(id, _)| *id)
    }

    /// Report that a replication caught up. Returns false if it is not running.
    pub fn complete_replication(&self, id: ReplicationId) -> bool {
        let inner = self.lock();
        match inner.replications.get(&id) {
            Some(r) => r.events.send(ReplicationEvent::Completed).is_ok(),
            None => false,
        }
    }

    /// Fail a replication, which also stops it. Returns false if it is not running.
    pub fn fail_replication(&self, id: ReplicationId, message: &str) -> bool {
        let mut inner = self.lock();
        match inner.replications.remove(&id) {
            Some(r) => r
                .events
                .send(ReplicationEvent::Failed {
                    message: message.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Apply fields written elsewhere, as an inbound replication would.
    ///
    /// Creates the document if it does not exist.
    pub fn merge_fields(
        &self,
        db: &DatabaseName,
        id: &DocId,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let mut doc = inner
            .database(db)?
            .get(id)
            .cloned()
            .unwrap_or_else(|| Document::from_fields(id.clone(), Map::new()));
        doc.merge(fields);
        inner.store_doc(db, doc)
    }

    /// Insert a whole document written elsewhere, as an inbound replication would.
    pub fn apply_remote(&self, db: &DatabaseName, doc: Document) -> Result<(), StoreError> {
        self.lock().store_doc(db, doc)
    }

    /// Cause the next put() to fail with the given error.
    pub fn fail_next_put(&self, error: &str) {
        self.lock().fail_next_put = Some(error.to_string());
    }

    /// Cause the next start_replication() to fail with the given error.
    pub fn fail_next_replication(&self, error: &str) {
        self.lock().fail_next_replication = Some(error.to_string());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_database(&self, db: &DatabaseName) -> Result<(), StoreError> {
        self.lock().databases.entry(db.clone()).or_default();
        Ok(())
    }

    async fn get(&self, db: &DatabaseName, id: &DocId) -> Result<Option<Document>, StoreError> {
        let inner = self.lock();
        Ok(inner.database(db)?.get(id).cloned())
    }

    async fn put(&self, db: &DatabaseName, doc: Document) -> Result<(), StoreError> {
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_put.take() {
            return Err(StoreError::Backend(error));
        }

        inner.store_doc(db, doc)
    }

    async fn delete(&self, db: &DatabaseName, id: &DocId) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let removed = inner.database_mut(db)?.remove(id);
        match removed {
            Some(doc) => {
                let doc_type = doc.doc_type().map(str::to_string);
                inner.notify(db, id.clone(), doc_type, true);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query(
        &self,
        db: &DatabaseName,
        filter: DocumentFilter<'_>,
    ) -> Result<Vec<Document>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .database(db)?
            .values()
            .filter(|doc| filter(doc))
            .cloned()
            .collect())
    }

    async fn changes(
        &self,
        db: &DatabaseName,
    ) -> Result<broadcast::Receiver<ChangeEvent>, StoreError> {
        let mut inner = self.lock();
        inner.database(db)?;
        Ok(inner.watcher(db).subscribe())
    }

    async fn start_replication(
        &self,
        spec: ReplicationSpec,
    ) -> Result<ReplicationHandle, StoreError> {
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_replication.take() {
            return Err(StoreError::ReplicationFailed(error));
        }
        inner.database(&spec.local)?;

        let id = ReplicationId::new(inner.next_replication);
        inner.next_replication += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        inner.replications.insert(
            id,
            ActiveReplication {
                spec: spec.clone(),
                events: tx,
            },
        );
        let _ = inner.started.send((id, spec));

        Ok(ReplicationHandle { id, events: rx })
    }

    async fn stop_replication(&self, id: ReplicationId) -> Result<(), StoreError> {
        self.lock()
            .replications
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::UnknownReplication(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncpoint_types::RemoteDatabase;

    fn db(name: &str) -> DatabaseName {
        DatabaseName::parse(name).unwrap()
    }

    fn pull_spec(local: &str) -> ReplicationSpec {
        ReplicationSpec::pull(db(local), RemoteDatabase::new("http://server", "remote"))
    }

    // ===========================================
    // Documents
    // ===========================================

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryStore::new();
        store.create_database(&db("ctl")).await.unwrap();

        let doc = Document::new(DocId::new("a"), "channel");
        store.put(&db("ctl"), doc.clone()).await.unwrap();

        assert_eq!(store.get(&db("ctl"), &DocId::new("a")).await.unwrap(), Some(doc));
        assert_eq!(store.document_count(&db("ctl")), 1);
    }

    #[tokio::test]
    async fn missing_database_is_an_error() {
        let store = MemoryStore::new();
        let err = store.get(&db("nope"), &DocId::new("a")).await.unwrap_err();
        assert_eq!(err, StoreError::DatabaseNotFound(db("nope")));
    }

    #[tokio::test]
    async fn create_database_is_idempotent() {
        let store = MemoryStore::new();
        store.create_database(&db("ctl")).await.unwrap();
        store
            .put(&db("ctl"), Document::new(DocId::new("a"), "channel"))
            .await
            .unwrap();
        store.create_database(&db("ctl")).await.unwrap();
        assert_eq!(store.document_count(&db("ctl")), 1);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = MemoryStore::new();
        store.create_database(&db("ctl")).await.unwrap();
        store
            .put(&db("ctl"), Document::new(DocId::new("a"), "channel"))
            .await
            .unwrap();

        assert!(store.delete(&db("ctl"), &DocId::new("a")).await.unwrap());
        assert!(!store.delete(&db("ctl"), &DocId::new("a")).await.unwrap());
    }

    #[tokio::test]
    async fn query_filters_documents() {
        let store = MemoryStore::new();
        store.create_database(&db("ctl")).await.unwrap();
        for (id, ty) in [("a", "channel"), ("b", "subscription"), ("c", "channel")] {
            store
                .put(&db("ctl"), Document::new(DocId::new(id), ty))
                .await
                .unwrap();
        }

        let channels = store
            .query(&db("ctl"), &|doc: &Document| doc.is_type("channel"))
            .await
            .unwrap();
        let ids: Vec<_> = channels.iter().map(|d| d.id().as_str().to_string()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn fail_next_put_fails_once() {
        let store = MemoryStore::new();
        store.create_database(&db("ctl")).await.unwrap();
        store.fail_next_put("disk full");

        let doc = Document::new(DocId::new("a"), "channel");
        let err = store.put(&db("ctl"), doc.clone()).await.unwrap_err();
        assert_eq!(err, StoreError::Backend("disk full".into()));
        assert!(store.put(&db("ctl"), doc).await.is_ok());
    }

    // ===========================================
    // Change notifications
    // ===========================================

    #[tokio::test]
    async fn changes_report_puts_and_deletes() {
        let store = MemoryStore::new();
        store.create_database(&db("ctl")).await.unwrap();
        let mut changes = store.changes(&db("ctl")).await.unwrap();

        store
            .put(&db("ctl"), Document::new(DocId::new("a"), "channel"))
            .await
            .unwrap();
        store.delete(&db("ctl"), &DocId::new("a")).await.unwrap();

        let first = changes.recv().await.unwrap();
        assert_eq!(first.doc_id, DocId::new("a"));
        assert_eq!(first.doc_type.as_deref(), Some("channel"));
        assert!(!first.deleted);

        let second = changes.recv().await.unwrap();
        assert!(second.deleted);
        assert_eq!(second.doc_type.as_deref(), Some("channel"));
    }

    #[tokio::test]
    async fn merge_fields_creates_and_updates() {
        let store = MemoryStore::new();
        store.create_database(&db("ctl")).await.unwrap();
        let mut changes = store.watch(&db("ctl"));

        let mut fields = Map::new();
        fields.insert("type".into(), json!("session"));
        fields.insert("user_id".into(), json!("u1"));
        store.merge_fields(&db("ctl"), &DocId::new("s"), fields).unwrap();

        let doc = store.document(&db("ctl"), &DocId::new("s")).unwrap();
        assert_eq!(doc.get_str("user_id"), Some("u1"));
        assert_eq!(changes.recv().await.unwrap().doc_id, DocId::new("s"));
    }

    // ===========================================
    // Replication
    // ===========================================

    #[tokio::test]
    async fn replication_lifecycle() {
        let store = MemoryStore::new();
        store.create_database(&db("ctl")).await.unwrap();
        let mut started = store.replication_starts();

        let mut handle = store.start_replication(pull_spec("ctl")).await.unwrap();
        assert_eq!(store.active_replication_count(), 1);
        assert_eq!(started.recv().await.unwrap().0, handle.id);
        assert_eq!(store.find_replication(&db("ctl"), Direction::Pull), Some(handle.id));

        assert!(store.complete_replication(handle.id));
        assert_eq!(handle.events.recv().await, Some(ReplicationEvent::Completed));

        store.stop_replication(handle.id).await.unwrap();
        assert_eq!(store.active_replication_count(), 0);
        assert_eq!(handle.events.recv().await, None);
    }

    #[tokio::test]
    async fn failed_replication_is_removed() {
        let store = MemoryStore::new();
        store.create_database(&db("ctl")).await.unwrap();
        let mut handle = store.start_replication(pull_spec("ctl")).await.unwrap();

        assert!(store.fail_replication(handle.id, "unreachable"));
        assert_eq!(
            handle.events.recv().await,
            Some(ReplicationEvent::Failed {
                message: "unreachable".into()
            })
        );
        assert_eq!(store.active_replication_count(), 0);
        assert_eq!(
            store.stop_replication(handle.id).await,
            Err(StoreError::UnknownReplication(handle.id))
        );
    }

    #[tokio::test]
    async fn replication_needs_local_database() {
        let store = MemoryStore::new();
        let err = store.start_replication(pull_spec("ctl")).await.unwrap_err();
        assert_eq!(err, StoreError::DatabaseNotFound(db("ctl")));
    }

    #[tokio::test]
    async fn fail_next_replication_fails_once() {
        let store = MemoryStore::new();
        store.create_database(&db("ctl")).await.unwrap();
        store.fail_next_replication("refused");

        let err = store.start_replication(pull_spec("ctl")).await.unwrap_err();
        assert_eq!(err, StoreError::ReplicationFailed("refused".into()));
        assert!(store.start_replication(pull_spec("ctl")).await.is_ok());
    }
}
