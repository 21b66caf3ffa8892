use std::fmt;
use thiserror::Error;

use crate::sanitize::sanitize_for_display;
use crate::validation::ValidationError;

/// Failures of the persistence and migration layers.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("validation failed: {}", join_errors(.0))]
    ValidationFailure(Vec<ValidationError>),
    #[error("stored data is corrupted: {0}")]
    CorruptedData(String),
    #[error("failed to save document: {0}")]
    SaveFailed(String),
    #[error("store initialization failed: {0}")]
    Initialization(String),
    #[error("no migration path from version {from} to version {to}")]
    MigrationNotFound { from: u32, to: u32 },
    #[error("rollback not supported: {0}")]
    RollbackNotSupported(String),
    #[error("rollback failed: {0}")]
    RollbackFailed(String),
    #[error("migration '{migration}' failed: {reason}")]
    MigrationExecutionFailed { migration: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ValidationFailure,
    CorruptedData,
    SaveFailed,
    Initialization,
    MigrationNotFound,
    RollbackNotSupported,
    RollbackFailed,
    MigrationExecutionFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            ErrorKind::ValidationFailure => "validation failure",
            ErrorKind::CorruptedData => "corrupted data",
            ErrorKind::SaveFailed => "save failed",
            ErrorKind::Initialization => "initialization",
            ErrorKind::MigrationNotFound => "migration not found",
            ErrorKind::RollbackNotSupported => "rollback not supported",
            ErrorKind::RollbackFailed => "rollback failed",
            ErrorKind::MigrationExecutionFailed => "migration failed",
        };
        f.write_str(label)
    }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::ValidationFailure(_) => ErrorKind::ValidationFailure,
            StoreError::CorruptedData(_) => ErrorKind::CorruptedData,
            StoreError::SaveFailed(_) => ErrorKind::SaveFailed,
            StoreError::Initialization(_) => ErrorKind::Initialization,
            StoreError::MigrationNotFound { .. } => ErrorKind::MigrationNotFound,
            StoreError::RollbackNotSupported(_) => ErrorKind::RollbackNotSupported,
            StoreError::RollbackFailed(_) => ErrorKind::RollbackFailed,
            StoreError::MigrationExecutionFailed { .. } => ErrorKind::MigrationExecutionFailed,
        }
    }

    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            StoreError::ValidationFailure(errors) => errors,
            _ => &[],
        }
    }

    /// Kind plus sanitized message, safe to show to a user.
    pub fn user_message(&self) -> String {
        format!("{}: {}", self.kind(), sanitize_for_display(&self.to_string()))
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures surfaced by the entity repositories.
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("{entity} named '{name}' already exists")]
    DuplicateName { entity: &'static str, name: String },
    #[error("{entity} '{id}' not found")]
    EntityNotFound { entity: &'static str, id: String },
    #[error("constraint violated: {0}")]
    ConstraintViolation(String),
    #[error("invalid {entity}: {}", join_errors(.errors))]
    Validation {
        entity: &'static str,
        errors: Vec<ValidationError>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the underlying byte store.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob store I/O error for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid blob key '{0}'")]
    InvalidKey(String),
    #[error("backup '{0}' failed integrity check")]
    Integrity(String),
    #[error("{0}")]
    Unavailable(String),
}

impl BlobStoreError {
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        BlobStoreError::Io {
            key: key.into(),
            source,
        }
    }
}

/// Raised by a migration's transform.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MigrationError(pub String);

impl MigrationError {
    pub fn new(message: impl Into<String>) -> Self {
        MigrationError(message.into())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a migration from version {from} to version {to} is already registered")]
    Duplicate { from: u32, to: u32 },
    #[error("migration '{0}' must change the version")]
    SelfLoop(String),
}
