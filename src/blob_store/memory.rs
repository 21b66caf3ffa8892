use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{BlobStore, backup_name, validate_key};
use crate::errors::BlobStoreError;

/// In-process blob store. Used by tests and by callers that embed the store
/// without touching disk. Writes and backups can be made to fail on demand.
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: Mutex<Inner>,
    fail_puts: AtomicBool,
    fail_backups: AtomicBool,
}

#[derive(Default)]
struct Inner {
    blobs: BTreeMap<String, Vec<u8>>,
    backups: Vec<(String, BTreeMap<String, Vec<u8>>)>,
    sequence: u64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `put` fails with an I/O error while set.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Every subsequent `create_backup` fails while set.
    pub fn fail_backups(&self, fail: bool) {
        self.fail_backups.store(fail, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner().blobs.keys().cloned().collect()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        validate_key(key)?;
        Ok(self.inner().blobs.get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        validate_key(key)?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BlobStoreError::io(
                key,
                std::io::Error::other("injected write failure"),
            ));
        }
        self.inner().blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        validate_key(key)?;
        self.inner().blobs.remove(key);
        Ok(())
    }

    fn create_backup(&self) -> Result<Option<String>, BlobStoreError> {
        if self.fail_backups.load(Ordering::SeqCst) {
            return Err(BlobStoreError::Unavailable(
                "injected backup failure".to_string(),
            ));
        }
        let mut inner = self.inner();
        if inner.blobs.is_empty() {
            return Ok(None);
        }
        inner.sequence += 1;
        let name = backup_name(inner.sequence);
        let snapshot = inner.blobs.clone();
        inner.backups.push((name.clone(), snapshot));
        Ok(Some(name))
    }

    fn restore_backup(&self, name: &str) -> Result<bool, BlobStoreError> {
        let mut inner = self.inner();
        let snapshot = inner
            .backups
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, blobs)| blobs.clone());
        match snapshot {
            Some(blobs) => {
                inner.blobs = blobs;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_backups(&self) -> Result<Vec<String>, BlobStoreError> {
        Ok(self
            .inner()
            .backups
            .iter()
            .rev()
            .map(|(name, _)| name.clone())
            .collect())
    }
}
