//! In-process document store with an optional durable journal.

use crate::error::{Result, StoreError};
use crate::subscriptions::{DropReason, SubscriptionConfig, SubscriptionHandle, SubscriptionManager};
use crate::types::{DocumentId, Timestamp, Version};
use fs2::FileExt;
use parking_lot::RwLock;
use serde_json::Map;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::journal::{Journal, JournalEntry, JournalOperation};
use super::operations::{apply_updates, FieldUpdate};
use super::{Document, DocumentStore, Query, QuerySnapshot, TransactionFn};

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"FDS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Distinguishes id seeds of stores opened in the same process.
static STORE_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory for the journal. `None` keeps everything in memory.
    pub path: Option<PathBuf>,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the journal every N commits (1 = every commit).
    pub sync_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
            sync_interval: 100,
        }
    }
}

impl StoreConfig {
    /// Durable store rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

/// Committed contents of the store.
#[derive(Default)]
struct Collections {
    documents: HashMap<String, HashMap<DocumentId, Document>>,
    /// Version of the last commit.
    version: Version,
    /// Timestamp of the last commit.
    last_timestamp: Timestamp,
    /// Creation sequence of the next document.
    next_sequence: u64,
}

impl Collections {
    /// Next server timestamp: wall clock, but strictly after the last commit.
    fn next_timestamp(&self) -> Timestamp {
        Timestamp::now().max(self.last_timestamp.next())
    }

    fn evaluate(&self, query: &Query) -> QuerySnapshot {
        let mut documents: Vec<Document> = self
            .documents
            .get(&query.collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default();
        query.sort(&mut documents);

        QuerySnapshot {
            version: self.version,
            documents,
        }
    }

    /// Apply a journal entry. Used both for live commits and for replay.
    fn apply(&mut self, entry: &JournalEntry) -> Result<()> {
        let collection = self.documents.entry(entry.collection.clone()).or_default();

        match &entry.operation {
            JournalOperation::Create { updates } => {
                if collection.contains_key(&entry.id) {
                    return Err(StoreError::DocumentExists {
                        collection: entry.collection.clone(),
                        id: entry.id.clone(),
                    });
                }

                let mut fields = Map::new();
                apply_updates(&mut fields, updates, entry.timestamp)?;

                collection.insert(
                    entry.id.clone(),
                    Document {
                        id: entry.id.clone(),
                        sequence: self.next_sequence,
                        version: entry.version,
                        fields,
                    },
                );
                self.next_sequence += 1;
            }

            JournalOperation::Update { updates } => {
                let doc = collection.get_mut(&entry.id).ok_or_else(|| {
                    StoreError::DocumentNotFound {
                        collection: entry.collection.clone(),
                        id: entry.id.clone(),
                    }
                })?;

                apply_updates(&mut doc.fields, updates, entry.timestamp)?;
                doc.version = entry.version;
            }
        }

        self.version = entry.version;
        self.last_timestamp = self.last_timestamp.max(entry.timestamp);
        Ok(())
    }
}

/// A document store living in this process.
///
/// All commits are serialized by one lock, which makes every batch of field
/// updates and every transaction atomic. With a configured path, commits are
/// journaled before they become visible and replayed on open.
pub struct LocalDocumentStore {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access (durable stores only).
    _lock_file: Option<File>,

    /// Journal of commits (durable stores only).
    journal: Option<Journal>,

    /// Committed documents.
    inner: RwLock<Collections>,

    /// Live query subscribers.
    subscriptions: Arc<SubscriptionManager>,

    /// Seed for document id derivation.
    id_seed: Vec<u8>,

    /// Counter for document id derivation.
    next_id: AtomicU64,

    /// Simulated connectivity; commits and reads fail while false.
    available: AtomicBool,
}

impl LocalDocumentStore {
    /// Create an empty in-memory store.
    pub fn in_memory() -> Self {
        Self::from_parts(StoreConfig::default(), None, None, Collections::default())
    }

    /// Open a store per the configuration.
    ///
    /// Without a path this is an empty in-memory store. With a path, an
    /// existing store is opened and its journal replayed, or a new one is
    /// created when `create_if_missing` is set.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let path = match &config.path {
            Some(path) => path.clone(),
            None => return Ok(Self::in_memory()),
        };

        if path.join("MANIFEST").exists() {
            Self::verify_manifest(&path)?;
        } else if config.create_if_missing {
            fs::create_dir_all(&path)?;
            Self::write_manifest(&path)?;
        } else {
            return Err(StoreError::NotInitialized);
        }

        let lock_file = Self::acquire_lock(&path)?;
        let (journal, entries) = Journal::open(path.join("journal.log"), config.sync_interval)?;

        let mut collections = Collections::default();
        for entry in &entries {
            collections.apply(entry)?;
        }

        info!(
            path = %path.display(),
            replayed = entries.len(),
            version = collections.version.0,
            "document store opened"
        );

        Ok(Self::from_parts(
            config,
            Some(lock_file),
            Some(journal),
            collections,
        ))
    }

    fn from_parts(
        config: StoreConfig,
        lock_file: Option<File>,
        journal: Option<Journal>,
        collections: Collections,
    ) -> Self {
        let mut id_seed = Vec::with_capacity(24);
        id_seed.extend_from_slice(&Timestamp::now().0.to_le_bytes());
        id_seed.extend_from_slice(&std::process::id().to_le_bytes());
        id_seed.extend_from_slice(&STORE_INSTANCE.fetch_add(1, Ordering::SeqCst).to_le_bytes());

        Self {
            config,
            _lock_file: lock_file,
            journal,
            inner: RwLock::new(collections),
            subscriptions: SubscriptionManager::new(),
            id_seed,
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing or regaining the backing connection.
    ///
    /// Going offline terminates every live subscription with
    /// [`DropReason::ConnectionLost`]; operations fail with
    /// [`StoreError::Unavailable`] until the store is back online.
    pub fn set_available(&self, available: bool) {
        // Commits and subscribes check availability under this lock, so none
        // can slip past the switch.
        let _inner = self.inner.write();
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            warn!("document store connection lost");
            self.subscriptions
                .terminate_all(DropReason::ConnectionLost("connection lost".to_string()));
        } else if !was && available {
            info!("document store connection restored");
        }
    }

    /// Current store version.
    pub fn version(&self) -> Version {
        self.inner.read().version
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    /// Flush the journal to disk.
    pub fn sync(&self) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    /// Store directory, if durable.
    pub fn path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection lost".to_string()))
        }
    }

    /// Journal, apply and broadcast one commit. Caller holds the write lock.
    fn commit(
        &self,
        inner: &mut Collections,
        collection: &str,
        id: DocumentId,
        operation: JournalOperation,
    ) -> Result<()> {
        let entry = JournalEntry {
            version: inner.version.next(),
            timestamp: inner.next_timestamp(),
            collection: collection.to_string(),
            id,
            operation,
        };

        // Validate against a scratch copy of the one document before journaling,
        // so a rejected batch never reaches the log.
        Self::validate(inner, &entry)?;

        if let Some(journal) = &self.journal {
            journal.append(&entry)?;
        }
        inner.apply(&entry)?;

        debug!(
            collection,
            id = %entry.id,
            version = entry.version.0,
            "commit applied"
        );

        let snapshot_source = &*inner;
        self.subscriptions
            .broadcast(collection, |query| Ok(snapshot_source.evaluate(query)));

        Ok(())
    }

    fn validate(inner: &Collections, entry: &JournalEntry) -> Result<()> {
        let existing = inner
            .documents
            .get(&entry.collection)
            .and_then(|docs| docs.get(&entry.id));

        match (&entry.operation, existing) {
            (JournalOperation::Create { updates }, None) => {
                apply_updates(&mut Map::new(), updates, entry.timestamp)
            }
            (JournalOperation::Create { .. }, Some(_)) => Err(StoreError::DocumentExists {
                collection: entry.collection.clone(),
                id: entry.id.clone(),
            }),
            (JournalOperation::Update { updates }, Some(doc)) => {
                apply_updates(&mut doc.fields.clone(), updates, entry.timestamp)
            }
            (JournalOperation::Update { .. }, None) => Err(StoreError::DocumentNotFound {
                collection: entry.collection.clone(),
                id: entry.id.clone(),
            }),
        }
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl DocumentStore for LocalDocumentStore {
    fn allocate_id(&self) -> DocumentId {
        DocumentId::derive(&self.id_seed, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn create(&self, collection: &str, updates: Vec<FieldUpdate>) -> Result<DocumentId> {
        let id = self.allocate_id();
        let mut inner = self.inner.write();
        self.ensure_available()?;
        self.commit(
            &mut inner,
            collection,
            id.clone(),
            JournalOperation::Create { updates },
        )?;

        Ok(id)
    }

    fn get(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
        let inner = self.inner.read();
        self.ensure_available()?;

        Ok(inner
            .documents
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn update(&self, collection: &str, id: &DocumentId, updates: Vec<FieldUpdate>) -> Result<()> {
        let mut inner = self.inner.write();
        self.ensure_available()?;
        self.commit(
            &mut inner,
            collection,
            id.clone(),
            JournalOperation::Update { updates },
        )
    }

    /// The callback runs under the store's write lock and must not call back
    /// into the store.
    fn transaction(
        &self,
        collection: &str,
        id: &DocumentId,
        f: &mut TransactionFn<'_>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        self.ensure_available()?;
        let current = inner
            .documents
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
            .ok_or_else(|| StoreError::DocumentNotFound {
                collection: collection.to_string(),
                id: id.clone(),
            })?;

        let updates = f(&current)?;
        if updates.is_empty() {
            return Ok(());
        }

        self.commit(
            &mut inner,
            collection,
            id.clone(),
            JournalOperation::Update { updates },
        )
    }

    fn query(&self, query: &Query) -> Result<QuerySnapshot> {
        let inner = self.inner.read();
        self.ensure_available()?;
        Ok(inner.evaluate(query))
    }

    fn subscribe(&self, query: Query, config: SubscriptionConfig) -> Result<SubscriptionHandle> {
        // Holding the read lock excludes commits and connection changes, so
        // nothing can slip in between the initial snapshot and registration.
        let inner = self.inner.read();
        self.ensure_available()?;
        let snapshot = inner.evaluate(&query);
        let handle = self.subscriptions.subscribe(query, &config);
        self.subscriptions.deliver_to(handle.id, snapshot);

        Ok(handle)
    }
}

impl Drop for LocalDocumentStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        if let Err(e) = self.sync() {
            warn!(error = %e, "journal sync on close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::QueryEvent;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn new_post(text: &str) -> Vec<FieldUpdate> {
        vec![
            FieldUpdate::set("text", text),
            FieldUpdate::server_timestamp("timestamp"),
        ]
    }

    fn posts_query() -> Query {
        Query::descending("posts", "timestamp")
    }

    fn next_snapshot(handle: &SubscriptionHandle) -> QuerySnapshot {
        match handle.recv_timeout(Duration::from_millis(500)).unwrap() {
            QueryEvent::Snapshot { snapshot } => snapshot,
            event => panic!("Expected Snapshot event, got {:?}", event),
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = LocalDocumentStore::in_memory();

        let id = store.create("posts", new_post("hello")).unwrap();
        let doc = store.get("posts", &id).unwrap().unwrap();

        assert_eq!(doc.fields["text"], "hello");
        assert!(doc.fields["timestamp"].as_i64().unwrap() > 0);
        assert_eq!(store.version(), Version(1));
    }

    #[test]
    fn test_server_timestamps_strictly_increase() {
        let store = LocalDocumentStore::in_memory();

        let mut last = 0;
        for i in 0..20 {
            let id = store.create("posts", new_post(&i.to_string())).unwrap();
            let ts = store.get("posts", &id).unwrap().unwrap().fields["timestamp"]
                .as_i64()
                .unwrap();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn test_update_missing_document() {
        let store = LocalDocumentStore::in_memory();

        let result = store.update(
            "posts",
            &DocumentId::from("missing"),
            vec![FieldUpdate::increment("shareCount", 1)],
        );

        assert!(matches!(result, Err(StoreError::DocumentNotFound { .. })));
        assert_eq!(store.version(), Version(0));
    }

    #[test]
    fn test_rejected_batch_does_not_commit() {
        let store = LocalDocumentStore::in_memory();
        let id = store
            .create("posts", vec![FieldUpdate::set("shareCount", "many")])
            .unwrap();

        let result = store.update("posts", &id, vec![FieldUpdate::increment("shareCount", 1)]);

        assert!(matches!(result, Err(StoreError::InvalidOperation(_))));
        assert_eq!(store.version(), Version(1));
    }

    #[test]
    fn test_transaction_sees_current_document() {
        let store = LocalDocumentStore::in_memory();
        let id = store.create("posts", new_post("hello")).unwrap();

        let mut seen = None;
        store
            .transaction("posts", &id, &mut |doc| {
                seen = Some(doc.fields["text"].clone());
                Ok(vec![FieldUpdate::array_union("likes", vec![json!("u1")])])
            })
            .unwrap();

        assert_eq!(seen, Some(json!("hello")));
        let doc = store.get("posts", &id).unwrap().unwrap();
        assert_eq!(doc.fields["likes"], json!(["u1"]));
    }

    #[test]
    fn test_empty_transaction_does_not_bump_version() {
        let store = LocalDocumentStore::in_memory();
        let id = store.create("posts", new_post("hello")).unwrap();

        store.transaction("posts", &id, &mut |_| Ok(vec![])).unwrap();

        assert_eq!(store.version(), Version(1));
    }

    #[test]
    fn test_subscribe_receives_initial_and_updates() {
        let store = LocalDocumentStore::in_memory();
        store.create("posts", new_post("first")).unwrap();

        let handle = store
            .subscribe(posts_query(), SubscriptionConfig::default())
            .unwrap();

        let initial = next_snapshot(&handle);
        assert_eq!(initial.documents.len(), 1);

        store.create("posts", new_post("second")).unwrap();
        let next = next_snapshot(&handle);
        assert_eq!(next.documents.len(), 2);
        assert_eq!(next.documents[0].fields["text"], "second");
        assert!(next.version > initial.version);
    }

    #[test]
    fn test_other_collections_do_not_notify() {
        let store = LocalDocumentStore::in_memory();
        let handle = store
            .subscribe(posts_query(), SubscriptionConfig::default())
            .unwrap();
        next_snapshot(&handle);

        store.create("drafts", new_post("draft")).unwrap();

        assert!(handle.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_connection_loss() {
        let store = LocalDocumentStore::in_memory();
        let handle = store
            .subscribe(posts_query(), SubscriptionConfig::default())
            .unwrap();
        next_snapshot(&handle);

        store.set_available(false);

        match handle.recv_timeout(Duration::from_millis(500)).unwrap() {
            QueryEvent::Dropped { reason } => {
                assert!(matches!(reason, DropReason::ConnectionLost(_)))
            }
            event => panic!("Expected Dropped event, got {:?}", event),
        }
        assert!(matches!(
            store.create("posts", new_post("offline")),
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true);
        assert!(store.create("posts", new_post("online")).is_ok());
    }

    #[test]
    fn test_subscribe_racing_connection_loss_is_terminated() {
        for _ in 0..100 {
            let store = LocalDocumentStore::in_memory();

            let subscribed = std::thread::scope(|s| {
                let subscriber =
                    s.spawn(|| store.subscribe(posts_query(), SubscriptionConfig::default()));
                s.spawn(|| store.set_available(false));
                subscriber.join().unwrap()
            });

            // Either refused outright, or registered before the loss and then dropped
            if let Ok(handle) = subscribed {
                next_snapshot(&handle);
                match handle.recv_timeout(Duration::from_millis(500)).unwrap() {
                    QueryEvent::Dropped { reason } => {
                        assert!(matches!(reason, DropReason::ConnectionLost(_)))
                    }
                    event => panic!("Expected Dropped event, got {:?}", event),
                }
            }
            assert_eq!(store.subscription_count(), 0);
        }
    }

    #[test]
    fn test_offline_commits_are_refused() {
        let store = LocalDocumentStore::in_memory();
        let id = store.create("posts", new_post("hello")).unwrap();
        store.set_available(false);

        assert!(matches!(
            store.update("posts", &id, vec![FieldUpdate::increment("shareCount", 1)]),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.transaction("posts", &id, &mut |_| Ok(vec![])),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(store.query(&posts_query()), Err(StoreError::Unavailable(_))));
        assert_eq!(store.version(), Version(1));
    }

    #[test]
    fn test_durable_store_replays() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("store"));

        let id = {
            let store = LocalDocumentStore::open(config.clone()).unwrap();
            let id = store.create("posts", new_post("persisted")).unwrap();
            store
                .update("posts", &id, vec![FieldUpdate::increment("shareCount", 2)])
                .unwrap();
            id
        };

        let store = LocalDocumentStore::open(config).unwrap();
        let doc = store.get("posts", &id).unwrap().unwrap();
        assert_eq!(doc.fields["text"], "persisted");
        assert_eq!(doc.fields["shareCount"], 2);
        assert_eq!(store.version(), Version(2));
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("store"));

        let _store = LocalDocumentStore::open(config.clone()).unwrap();
        let result = LocalDocumentStore::open(config);

        assert!(matches!(result, Err(StoreError::Locked)));
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            path: Some(dir.path().join("absent")),
            create_if_missing: false,
            ..Default::default()
        };

        let result = LocalDocumentStore::open(config);
        assert!(matches!(result, Err(StoreError::NotInitialized)));
    }
}
