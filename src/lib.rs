//! Versioned single-document store.
//!
//! One JSON document holds every identity, server profile, project and
//! message. All access goes through a [`store::DataStore`], which validates
//! each write, serializes access behind one lock and migrates older
//! documents forward with a backup to roll back to.

pub mod blob_store;
pub mod config;
pub mod errors;
pub mod logger;
pub mod migration;
pub mod models;
pub mod paths;
pub mod persistence;
pub mod repository;
pub mod sanitize;
pub mod store;
pub mod validation;

pub use errors::{BlobStoreError, ErrorKind, MigrationError, RegistryError, RepositoryError, StoreError};
pub use store::DataStore;
