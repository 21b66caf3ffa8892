use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::warn;

use crate::blob_store::BlobStore;
use crate::errors::StoreError;

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationOperation {
    #[default]
    Migrate,
    Rollback,
}

impl fmt::Display for MigrationOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MigrationOperation::Migrate => f.write_str("migrate"),
            MigrationOperation::Rollback => f.write_str("rollback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationLogEntry {
    pub timestamp: DateTime<Utc>,
    /// `None` when the run failed before the stored version was known.
    #[serde(default)]
    pub from_version: Option<u32>,
    pub to_version: u32,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub operation: MigrationOperation,
}

/// Most recent log entries, oldest first, capped at `limit`.
#[derive(Debug, Clone)]
pub struct MigrationHistory {
    entries: VecDeque<MigrationLogEntry>,
    limit: usize,
}

impl MigrationHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Reads the history stored under `key`. Unreadable history is logged
    /// and replaced by an empty one; it never blocks startup.
    pub fn load(store: &dyn BlobStore, key: &str, limit: usize) -> Self {
        let mut history = Self::new(limit);
        let entries: Vec<MigrationLogEntry> = match store.get(key) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, "migration history is corrupted; starting empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "failed to read migration history");
                Vec::new()
            }
        };
        for entry in entries {
            history.push(entry);
        }
        history
    }

    pub fn persist(&self, store: &dyn BlobStore, key: &str) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&self.entries)
            .map_err(|e| StoreError::SaveFailed(format!("failed to serialize migration history: {e}")))?;
        store
            .put(key, &bytes)
            .map_err(|e| StoreError::SaveFailed(e.to_string()))
    }

    pub fn push(&mut self, entry: MigrationLogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<MigrationLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&MigrationLogEntry> {
        self.entries.back()
    }

    /// Backups taken by successful migrations, newest first.
    pub fn migration_backups(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.success && entry.operation == MigrationOperation::Migrate)
            .filter_map(|entry| entry.backup_filename.as_deref())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
