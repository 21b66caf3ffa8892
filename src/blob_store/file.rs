use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::{BlobStore, backup_name, validate_key};
use crate::errors::BlobStoreError;

const BLOB_EXTENSION: &str = "bin";
const METADATA_FILE: &str = "backup_metadata.json";

/// One file per key under `data/`; backups are directories under `backups/`
/// carrying a SHA-256 checksum per blob.
pub struct FileBlobStore {
    data_dir: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
    sequence: AtomicU64,
}

/// Written next to the blob copies in every backup directory.
#[derive(Debug, Serialize, Deserialize)]
struct BackupMetadata {
    created_at: String,
    /// Key to hex SHA-256 of the copied blob.
    checksums: BTreeMap<String, String>,
}

impl FileBlobStore {
    pub fn new(data_dir: PathBuf, backup_dir: PathBuf, max_backups: usize) -> Result<Self, BlobStoreError> {
        for dir in [&data_dir, &backup_dir] {
            fs::create_dir_all(dir).map_err(|e| BlobStoreError::io(dir.display().to_string(), e))?;
            #[cfg(unix)]
            {
                use std::fs::Permissions;
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(dir, Permissions::from_mode(0o700));
            }
        }
        Ok(Self {
            data_dir,
            backup_dir,
            max_backups: max_backups.max(1),
            sequence: AtomicU64::new(0),
        })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.{BLOB_EXTENSION}"))
    }

    fn live_keys(&self) -> Result<Vec<String>, BlobStoreError> {
        keys_in(&self.data_dir)
    }

    fn backup_path(&self, name: &str) -> Option<PathBuf> {
        let valid = name.starts_with("backup_") && validate_key(name).is_ok();
        valid.then(|| self.backup_dir.join(name))
    }

    fn read_metadata(&self, dir: &Path) -> Result<BackupMetadata, BlobStoreError> {
        let path = dir.join(METADATA_FILE);
        let data = fs::read(&path).map_err(|e| BlobStoreError::io(path.display().to_string(), e))?;
        serde_json::from_slice(&data).map_err(|_| BlobStoreError::Integrity(dir.display().to_string()))
    }

    fn cleanup_old_backups(&self) -> Result<(), BlobStoreError> {
        let backups = self.list_backups()?;
        for name in backups.iter().skip(self.max_backups) {
            let path = self.backup_dir.join(name);
            debug!(backup = %name, "removing expired backup");
            if let Err(err) = fs::remove_dir_all(&path) {
                warn!(backup = %name, error = %err, "failed to remove expired backup");
            }
        }
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        validate_key(key)?;
        match fs::read(self.blob_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BlobStoreError::io(key, err)),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        validate_key(key)?;
        write_atomic(&self.data_dir, &self.blob_path(key), bytes).map_err(|e| BlobStoreError::io(key, e))
    }

    fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        validate_key(key)?;
        match fs::remove_file(self.blob_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BlobStoreError::io(key, err)),
        }
    }

    fn create_backup(&self) -> Result<Option<String>, BlobStoreError> {
        let keys = self.live_keys()?;
        if keys.is_empty() {
            return Ok(None);
        }

        let name = backup_name(self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        let dir = self.backup_dir.join(&name);
        fs::create_dir_all(&dir).map_err(|e| BlobStoreError::io(&name, e))?;

        let mut checksums = BTreeMap::new();
        for key in keys {
            let bytes = fs::read(self.blob_path(&key)).map_err(|e| BlobStoreError::io(&key, e))?;
            let target = dir.join(format!("{key}.{BLOB_EXTENSION}"));
            write_atomic(&dir, &target, &bytes).map_err(|e| BlobStoreError::io(&key, e))?;
            checksums.insert(key, checksum(&bytes));
        }

        let metadata = BackupMetadata {
            created_at: Utc::now().to_rfc3339(),
            checksums,
        };
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| BlobStoreError::Unavailable(format!("failed to serialize backup metadata: {e}")))?;
        write_atomic(&dir, &dir.join(METADATA_FILE), &json).map_err(|e| BlobStoreError::io(&name, e))?;

        debug!(backup = %name, blobs = metadata.checksums.len(), "backup created");
        self.cleanup_old_backups()?;
        Ok(Some(name))
    }

    fn restore_backup(&self, name: &str) -> Result<bool, BlobStoreError> {
        let Some(dir) = self.backup_path(name) else {
            return Ok(false);
        };
        if !dir.is_dir() {
            return Ok(false);
        }
        let metadata = self.read_metadata(&dir)?;

        // Verify every blob before touching live data.
        let mut restored = Vec::with_capacity(metadata.checksums.len());
        for (key, expected) in &metadata.checksums {
            validate_key(key)?;
            let path = dir.join(format!("{key}.{BLOB_EXTENSION}"));
            let bytes = fs::read(&path).map_err(|_| BlobStoreError::Integrity(name.to_string()))?;
            if checksum(&bytes) != *expected {
                warn!(backup = %name, key = %key, "backup checksum mismatch");
                return Err(BlobStoreError::Integrity(name.to_string()));
            }
            restored.push((key.clone(), bytes));
        }

        for (key, bytes) in &restored {
            self.put(key, bytes)?;
        }
        for key in self.live_keys()? {
            if !metadata.checksums.contains_key(&key) {
                self.delete(&key)?;
            }
        }
        debug!(backup = %name, blobs = restored.len(), "backup restored");
        Ok(true)
    }

    fn list_backups(&self) -> Result<Vec<String>, BlobStoreError> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.backup_dir)
            .map_err(|e| BlobStoreError::io(self.backup_dir.display().to_string(), e))?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(METADATA_FILE).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| name.starts_with("backup_"))
            .collect();
        names.sort_by(|a, b| b.cmp(a));
        Ok(names)
    }
}

fn keys_in(dir: &Path) -> Result<Vec<String>, BlobStoreError> {
    let entries = fs::read_dir(dir).map_err(|e| BlobStoreError::io(dir.display().to_string(), e))?;
    let mut keys: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BLOB_EXTENSION) {
                return None;
            }
            let key = path.file_stem()?.to_str()?.to_string();
            validate_key(&key).ok().map(|_| key)
        })
        .collect();
    keys.sort();
    Ok(keys)
}

/// Writes through a dot-prefixed temp file in the same directory and renames
/// it over the target.
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("blob");
    let temp = dir.join(format!(".{file_name}.tmp"));
    fs::write(&temp, bytes)?;
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp, Permissions::from_mode(0o600))?;
    }
    fs::rename(&temp, target)
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(root: &Path, max_backups: usize) -> FileBlobStore {
        FileBlobStore::new(root.join("data"), root.join("backups"), max_backups).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let temp = tempdir().unwrap();
        let store = store(temp.path(), 3);

        assert_eq!(store.get("doc").unwrap(), None);
        store.put("doc", b"hello").unwrap();
        assert_eq!(store.get("doc").unwrap(), Some(b"hello".to_vec()));
        store.delete("doc").unwrap();
        store.delete("doc").unwrap();
        assert_eq!(store.get("doc").unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_blob_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempdir().unwrap();
        let store = store(temp.path(), 3);
        store.put("doc", b"hello").unwrap();
        let mode = fs::metadata(temp.path().join("data/doc.bin")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_backup_round_trip_removes_newer_keys() {
        let temp = tempdir().unwrap();
        let store = store(temp.path(), 3);
        store.put("doc", b"v1").unwrap();
        let backup = store.create_backup().unwrap().unwrap();

        store.put("doc", b"v2").unwrap();
        store.put("later", b"x").unwrap();
        assert!(store.restore_backup(&backup).unwrap());

        assert_eq!(store.get("doc").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get("later").unwrap(), None);
    }

    #[test]
    fn test_tampered_backup_is_rejected() {
        let temp = tempdir().unwrap();
        let store = store(temp.path(), 3);
        store.put("doc", b"v1").unwrap();
        let backup = store.create_backup().unwrap().unwrap();
        store.put("doc", b"v2").unwrap();

        fs::write(temp.path().join("backups").join(&backup).join("doc.bin"), b"evil").unwrap();
        let err = store.restore_backup(&backup).unwrap_err();
        assert!(matches!(err, BlobStoreError::Integrity(_)));
        assert_eq!(store.get("doc").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_retention_keeps_newest() {
        let temp = tempdir().unwrap();
        let store = store(temp.path(), 2);
        store.put("doc", b"v1").unwrap();
        let mut created = Vec::new();
        for _ in 0..4 {
            created.push(store.create_backup().unwrap().unwrap());
        }
        let listed = store.list_backups().unwrap();
        assert_eq!(listed, vec![created[3].clone(), created[2].clone()]);
    }

    #[test]
    fn test_unknown_backup() {
        let temp = tempdir().unwrap();
        let store = store(temp.path(), 2);
        assert!(!store.restore_backup("backup_missing").unwrap());
        assert!(!store.restore_backup("../data").unwrap());
    }

    #[test]
    fn test_invalid_key_rejected() {
        let temp = tempdir().unwrap();
        let store = store(temp.path(), 2);
        assert!(matches!(store.put("../x", b"1"), Err(BlobStoreError::InvalidKey(_))));
    }
}
