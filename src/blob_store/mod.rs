//! Durable byte storage underneath the document store.
//!
//! The persistence layer treats a blob store as an opaque key/value map with
//! whole-store snapshots. Encryption, if any, is the implementation's
//! business; nothing above this trait inspects the bytes.

pub mod file;
pub mod memory;

use chrono::Utc;

use crate::errors::BlobStoreError;

pub use file::FileBlobStore;
pub use memory::MemoryBlobStore;

pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError>;

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError>;

    fn delete(&self, key: &str) -> Result<(), BlobStoreError>;

    /// Snapshots every key. Returns the backup name, or `None` when there
    /// is nothing to snapshot.
    fn create_backup(&self) -> Result<Option<String>, BlobStoreError>;

    /// Replaces the live key set with the named snapshot. `Ok(false)` means
    /// no backup of that name exists.
    fn restore_backup(&self, name: &str) -> Result<bool, BlobStoreError>;

    /// Backup names, newest first.
    fn list_backups(&self) -> Result<Vec<String>, BlobStoreError>;
}

/// Keys become file names, so they are limited to `[A-Za-z0-9._-]` and may
/// not start with a dot.
pub fn validate_key(key: &str) -> Result<(), BlobStoreError> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BlobStoreError::InvalidKey(key.to_string()))
    }
}

/// `backup_<date>_<time>_<millis>_<seq>`; sorts chronologically as text.
pub(crate) fn backup_name(sequence: u64) -> String {
    format!(
        "backup_{}_{:06}",
        Utc::now().format("%Y%m%d_%H%M%S_%3f"),
        sequence
    )
}
