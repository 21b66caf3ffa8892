//! Cached, lock-serialized access to the single stored document.
//!
//! Every read, write, migration and rollback goes through [`PersistenceCore::lock`].
//! The lock is a FIFO-fair async mutex, so callers queue in request order and
//! never interleave. The cache and the observer channel only ever hold a
//! document that passed full validation.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, info, warn};

use crate::blob_store::BlobStore;
use crate::errors::{BlobStoreError, StoreError};
use crate::models::Document;
use crate::validation::{ValidationResult, validate_document};

type Snapshot = Option<Arc<Document>>;

pub struct PersistenceCore {
    store: Arc<dyn BlobStore>,
    document_key: String,
    state: Mutex<Snapshot>,
    publisher: watch::Sender<Snapshot>,
}

impl PersistenceCore {
    pub fn new(store: Arc<dyn BlobStore>, document_key: impl Into<String>) -> Self {
        let (publisher, _) = watch::channel(None);
        Self {
            store,
            document_key: document_key.into(),
            state: Mutex::new(None),
            publisher,
        }
    }

    pub fn document_key(&self) -> &str {
        &self.document_key
    }

    pub fn blob_store(&self) -> &dyn BlobStore {
        self.store.as_ref()
    }

    /// Waits for exclusive access. Hold the guard for the whole
    /// read-modify-write so no other operation can interleave.
    pub async fn lock(&self) -> PersistenceGuard<'_> {
        PersistenceGuard {
            core: self,
            cache: self.state.lock().await,
        }
    }

    pub async fn load(&self) -> Result<Arc<Document>, StoreError> {
        self.lock().await.load()
    }

    pub async fn save(&self, document: Document) -> Result<Arc<Document>, StoreError> {
        self.lock().await.save(document)
    }

    /// Replay-latest stream of the cached document.
    pub fn observe(&self) -> DocumentWatch<Arc<Document>> {
        self.observe_with(|document: &Arc<Document>| Arc::clone(document))
    }

    /// Like [`observe`](Self::observe) but projected through `project`.
    pub fn observe_with<T, F>(&self, project: F) -> DocumentWatch<T>
    where
        F: Fn(&Arc<Document>) -> T + Send + Sync + 'static,
    {
        DocumentWatch {
            receiver: self.publisher.subscribe(),
            project: Arc::new(project),
            primed: false,
        }
    }

    /// Pretty JSON of the current document, produced through the same
    /// load path as every read.
    pub async fn export_data(&self) -> Result<String, StoreError> {
        let document = self.load().await?;
        serde_json::to_string_pretty(document.as_ref())
            .map_err(|e| StoreError::SaveFailed(format!("failed to serialize document: {e}")))
    }

    /// Replaces the stored document with `json`, held to the same
    /// validation as a normal save.
    pub async fn import_data(&self, json: &str) -> Result<Arc<Document>, StoreError> {
        let document = decode(json.as_bytes())?;
        let mut guard = self.lock().await;
        let saved = guard.save(document)?;
        info!(version = saved.version, counts = %saved.counts(), "document imported");
        Ok(saved)
    }

    /// Drops the cache and tells observers there is no document.
    pub async fn teardown(&self) {
        let mut guard = self.lock().await;
        guard.invalidate();
        self.publisher.send_replace(None);
    }

    fn publish(&self, document: &Arc<Document>) {
        self.publisher.send_replace(Some(Arc::clone(document)));
    }
}

/// Exclusive access to the document. Dropping it releases the lock.
pub struct PersistenceGuard<'a> {
    core: &'a PersistenceCore,
    cache: MutexGuard<'a, Snapshot>,
}

impl PersistenceGuard<'_> {
    pub fn cached(&self) -> Option<Arc<Document>> {
        self.cache.clone()
    }

    pub fn blob_store(&self) -> &dyn BlobStore {
        self.core.blob_store()
    }

    /// Cached document, or the stored one after validation.
    pub fn load(&mut self) -> Result<Arc<Document>, StoreError> {
        if let Some(document) = self.cache.as_ref() {
            return Ok(Arc::clone(document));
        }
        let document = self.read_stored()?.ok_or_else(|| {
            StoreError::Initialization(format!(
                "no document stored under '{}'; initialize the store first",
                self.core.document_key
            ))
        })?;
        if let ValidationResult::Failure(errors) = validate_document(&document) {
            warn!(errors = errors.len(), "stored document failed validation");
            return Err(StoreError::ValidationFailure(errors));
        }
        let document = Arc::new(document);
        *self.cache = Some(Arc::clone(&document));
        self.core.publish(&document);
        debug!(version = document.version, "document loaded");
        Ok(document)
    }

    /// Reads and decodes the stored document without validating or caching.
    pub fn read_stored(&self) -> Result<Option<Document>, StoreError> {
        match self.raw()? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn raw(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.core
            .store
            .get(&self.core.document_key)
            .map_err(|e| StoreError::CorruptedData(format!("failed to read document: {e}")))
    }

    /// Writes bytes under the document key, bypassing validation. Only used
    /// to put back a snapshot taken from the store itself.
    pub fn restore_raw(&mut self, bytes: Option<&[u8]>) -> Result<(), StoreError> {
        let key = &self.core.document_key;
        let result = match bytes {
            Some(bytes) => self.core.store.put(key, bytes),
            None => self.core.store.delete(key),
        };
        self.invalidate();
        result.map_err(|e| StoreError::SaveFailed(e.to_string()))
    }

    /// Validates, stamps `lastModified`, writes, and only then updates the
    /// cache and notifies observers. On error the cache is untouched.
    pub fn save(&mut self, mut document: Document) -> Result<Arc<Document>, StoreError> {
        if let ValidationResult::Failure(errors) = validate_document(&document) {
            debug!(errors = errors.len(), "save rejected by validation");
            return Err(StoreError::ValidationFailure(errors));
        }
        document.last_modified = Utc::now();
        let bytes = serde_json::to_vec(&document)
            .map_err(|e| StoreError::SaveFailed(format!("failed to serialize document: {e}")))?;
        self.core
            .store
            .put(&self.core.document_key, &bytes)
            .map_err(|e: BlobStoreError| StoreError::SaveFailed(e.to_string()))?;

        let document = Arc::new(document);
        *self.cache = Some(Arc::clone(&document));
        self.core.publish(&document);
        debug!(version = document.version, bytes = bytes.len(), "document saved");
        Ok(document)
    }

    pub fn invalidate(&mut self) {
        *self.cache = None;
    }

    pub fn reload(&mut self) -> Result<Arc<Document>, StoreError> {
        self.invalidate();
        self.load()
    }
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Document, StoreError> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::CorruptedData(format!("document is not valid JSON: {e}")))
}

type Projection<T> = dyn Fn(&Arc<Document>) -> T + Send + Sync;

/// Subscription to the cached document. The first [`next`](Self::next)
/// yields the current value immediately; later calls wait for a change.
/// `Some(None)` means no document is loaded.
pub struct DocumentWatch<T> {
    receiver: watch::Receiver<Snapshot>,
    project: Arc<Projection<T>>,
    primed: bool,
}

impl<T> DocumentWatch<T> {
    /// Current value without waiting.
    pub fn latest(&self) -> Option<T> {
        self.receiver.borrow().as_ref().map(|document| (self.project)(document))
    }

    /// `None` once the store has been dropped.
    pub async fn next(&mut self) -> Option<Option<T>> {
        if self.primed && self.receiver.changed().await.is_err() {
            return None;
        }
        self.primed = true;
        let snapshot = self.receiver.borrow_and_update().clone();
        Some(snapshot.as_ref().map(|document| (self.project)(document)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;
    use crate::models::{Identity, KeyType, ServerProfile};

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGq3 dev@laptop";

    fn core() -> (Arc<MemoryBlobStore>, PersistenceCore) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let core = PersistenceCore::new(blobs.clone(), "app_document");
        (blobs, core)
    }

    #[tokio::test]
    async fn test_load_without_document_is_initialization_error() {
        let (_, core) = core();
        let err = core.load().await.unwrap_err();
        assert!(matches!(err, StoreError::Initialization(_)));
    }

    #[tokio::test]
    async fn test_save_then_load_uses_cache() {
        let (blobs, core) = core();
        let saved = core.save(Document::new()).await.unwrap();
        blobs.put("app_document", b"not json").unwrap();
        let loaded = core.load().await.unwrap();
        assert!(Arc::ptr_eq(&saved, &loaded));
    }

    #[tokio::test]
    async fn test_corrupt_bytes() {
        let (blobs, core) = core();
        blobs.put("app_document", b"{oops").unwrap();
        assert!(matches!(core.load().await, Err(StoreError::CorruptedData(_))));
    }

    #[tokio::test]
    async fn test_invalid_save_keeps_previous_cache() {
        let (_, core) = core();
        let first = core.save(Document::new()).await.unwrap();

        let mut bad = (*first).clone();
        bad.server_profiles.push(ServerProfile::new("prod", "example.com", "deploy", "x"));
        assert!(matches!(core.save(bad).await, Err(StoreError::ValidationFailure(_))));

        let current = core.load().await.unwrap();
        assert!(Arc::ptr_eq(&first, &current));
    }

    #[tokio::test]
    async fn test_failed_put_keeps_previous_cache() {
        let (blobs, core) = core();
        let first = core.save(Document::new()).await.unwrap();
        blobs.fail_puts(true);

        let mut next = (*first).clone();
        next.identities.push(Identity::new("Dev", KeyType::Ed25519, KEY));
        assert!(matches!(core.save(next).await, Err(StoreError::SaveFailed(_))));
        assert!(core.load().await.unwrap().identities.is_empty());
    }

    #[tokio::test]
    async fn test_observer_replays_latest_then_updates() {
        let (_, core) = core();
        core.save(Document::new()).await.unwrap();

        let mut watch = core.observe_with(|doc: &Arc<Document>| doc.identities.len());
        assert_eq!(watch.next().await, Some(Some(0)));

        let mut next = (*core.load().await.unwrap()).clone();
        next.identities.push(Identity::new("Dev", KeyType::Ed25519, KEY));
        core.save(next).await.unwrap();
        assert_eq!(watch.next().await, Some(Some(1)));

        core.teardown().await;
        assert_eq!(watch.next().await, Some(None));
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let (_, core) = core();
        let mut doc = Document::new();
        doc.identities.push(Identity::new("Dev", KeyType::Ed25519, KEY));
        core.save(doc).await.unwrap();

        let json = core.export_data().await.unwrap();
        let (_, other) = self::core();
        let imported = other.import_data(&json).await.unwrap();
        assert_eq!(imported.identities, core.load().await.unwrap().identities);
    }

    #[tokio::test]
    async fn test_import_rejects_invalid_document() {
        let (_, core) = core();
        let json = r#"{"version": 0}"#;
        assert!(matches!(core.import_data(json).await, Err(StoreError::ValidationFailure(_))));
        assert!(matches!(core.import_data("42").await, Err(StoreError::CorruptedData(_))));
    }
}
