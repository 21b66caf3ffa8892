//! The store object that outside code holds.
//!
//! A [`DataStore`] owns one [`PersistenceCore`], the migration coordinator
//! and the entity repositories, all sharing the same lock. Construct it once,
//! call [`DataStore::initialize`] before anything else and pass it by
//! reference to whatever needs the document.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::blob_store::{BlobStore, FileBlobStore, MemoryBlobStore};
use crate::config::StoreConfig;
use crate::errors::StoreError;
use crate::migration::{
    MigrationCoordinator, MigrationLogEntry, MigrationOutcome, MigrationPlan, MigrationProgress, MigrationRegistry,
    RollbackOutcome, RunOptions, builtin,
};
use crate::models::{Document, INITIAL_VERSION};
use crate::paths::StorePaths;
use crate::persistence::{DocumentWatch, PersistenceCore, decode};
use crate::repository::{
    Context, IdentityRepository, MessageRepository, ProjectRepository, ServerProfileRepository,
};
use crate::validation::{ValidationError, ValidationResult, validate_document};

pub struct DataStore {
    config: StoreConfig,
    persistence: Arc<PersistenceCore>,
    coordinator: MigrationCoordinator,
    identities: IdentityRepository,
    server_profiles: ServerProfileRepository,
    projects: ProjectRepository,
    messages: MessageRepository,
}

impl DataStore {
    pub fn new(store: Arc<dyn BlobStore>, registry: MigrationRegistry, config: StoreConfig) -> Self {
        let persistence = Arc::new(PersistenceCore::new(store, config.document_key.clone()));
        let coordinator = MigrationCoordinator::new(
            Arc::clone(&persistence),
            registry,
            config.history_key.clone(),
            config.history_limit,
        );
        coordinator.reload_history(persistence.blob_store());
        let context = Context {
            persistence: Arc::clone(&persistence),
            timeout: config.validation_timeout(),
        };
        Self {
            identities: IdentityRepository::new(context.clone()),
            server_profiles: ServerProfileRepository::new(context.clone()),
            projects: ProjectRepository::new(context.clone()),
            messages: MessageRepository::new(context),
            config,
            persistence,
            coordinator,
        }
    }

    /// File-backed store under `paths` with the built-in migrations.
    pub fn open(paths: &StorePaths, config: StoreConfig) -> Result<Self, StoreError> {
        paths
            .ensure_base_dir()
            .map_err(|e| StoreError::Initialization(format!("failed to prepare {}: {e}", paths.base_dir.display())))?;
        let blobs = FileBlobStore::new(paths.data_dir.clone(), paths.backup_dir.clone(), config.max_backups)
            .map_err(|e| StoreError::Initialization(e.to_string()))?;
        let registry = builtin::registry().map_err(|e| StoreError::Initialization(e.to_string()))?;
        Ok(Self::new(Arc::new(blobs), registry, config))
    }

    /// Process-local store with the built-in migrations.
    pub fn in_memory() -> Result<Self, StoreError> {
        let registry = builtin::registry().map_err(|e| StoreError::Initialization(e.to_string()))?;
        Ok(Self::new(
            Arc::new(MemoryBlobStore::new()),
            registry,
            StoreConfig::default(),
        ))
    }

    /// Brings the store to a usable state: loads the migration history,
    /// creates an empty document on first run and migrates an older
    /// document to the latest version.
    pub async fn initialize(&self) -> Result<Arc<Document>, StoreError> {
        let mut guard = self.persistence.lock().await;
        self.coordinator.reload_history(guard.blob_store());
        let latest = self.coordinator.latest_version();

        let document = match guard.read_stored()? {
            Some(document) => document,
            None => {
                info!(version = INITIAL_VERSION, "no stored document; creating one");
                let created = guard.save(Document::new())?;
                (*created).clone()
            }
        };

        if document.version > latest {
            return Err(StoreError::Initialization(format!(
                "stored document is version {} but this build supports at most version {latest}",
                document.version
            )));
        }
        if document.version == latest {
            let loaded = guard.load()?;
            info!(version = loaded.version, counts = %loaded.counts(), "store initialized");
            return Ok(loaded);
        }

        let options = RunOptions {
            target: latest,
            create_backup: self.config.backup_before_migration,
            force_validation: false,
        };
        match self.coordinator.migrate_locked(&mut guard, document, options).await {
            MigrationOutcome::Success(report) => {
                info!(
                    from = report.from_version,
                    to = report.to_version,
                    "store initialized after migration"
                );
                Ok(report.document)
            }
            MigrationOutcome::Skipped { .. } => Ok(guard.load()?),
            MigrationOutcome::Failure(error) => {
                warn!(error = %error, "startup migration failed");
                Err(StoreError::Initialization(format!(
                    "migration to version {latest} failed: {error}"
                )))
            }
        }
    }

    /// Drops the cached document and tells observers it is gone.
    pub async fn teardown(&self) {
        self.persistence.teardown().await;
        info!("store torn down");
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn load(&self) -> Result<Arc<Document>, StoreError> {
        self.persistence.load().await
    }

    pub async fn save(&self, document: Document) -> Result<Arc<Document>, StoreError> {
        self.persistence.save(document).await
    }

    /// Full validation of the current document.
    pub async fn validate(&self) -> Result<ValidationResult, StoreError> {
        let guard = self.persistence.lock().await;
        let document = match guard.cached() {
            Some(document) => document,
            None => match guard.read_stored()? {
                Some(document) => Arc::new(document),
                None => return Err(StoreError::Initialization("no document has been stored".to_string())),
            },
        };
        Ok(validate_document(&document))
    }

    pub async fn export_data(&self) -> Result<String, StoreError> {
        self.persistence.export_data().await
    }

    /// Replaces the document with `json`. Documents from a newer schema
    /// than this build knows are refused.
    pub async fn import_data(&self, json: &str) -> Result<Arc<Document>, StoreError> {
        let version = decode(json.as_bytes())?.version;
        let latest = self.coordinator.latest_version();
        if version > latest {
            return Err(StoreError::ValidationFailure(vec![ValidationError::field(
                "version",
                format!("version {version} is newer than the latest supported version {latest}"),
            )]));
        }
        self.persistence.import_data(json).await
    }

    pub fn observe(&self) -> DocumentWatch<Arc<Document>> {
        self.persistence.observe()
    }

    /// Options for a run to `target` using the configured backup policy.
    pub fn run_options(&self, target: u32) -> RunOptions {
        RunOptions {
            target,
            create_backup: self.config.backup_before_migration,
            force_validation: false,
        }
    }

    pub async fn migrate_to_latest(&self) -> MigrationOutcome {
        self.migrate(self.run_options(self.latest_version())).await
    }

    pub async fn migrate_to_version(&self, target: u32) -> MigrationOutcome {
        self.migrate(self.run_options(target)).await
    }

    pub async fn migrate(&self, options: RunOptions) -> MigrationOutcome {
        self.coordinator.migrate(options).await
    }

    pub async fn rollback(&self, backup: Option<&str>) -> RollbackOutcome {
        self.coordinator.rollback(backup).await
    }

    /// What migrating to `target` (default: latest) would do.
    pub async fn plan_migration(&self, target: Option<u32>) -> Result<MigrationPlan, StoreError> {
        let document = self.persistence.load().await?;
        let target = target.unwrap_or_else(|| self.latest_version());
        Ok(self.coordinator.plan(&document, target))
    }

    pub fn observe_migration_progress(&self) -> watch::Receiver<MigrationProgress> {
        self.coordinator.observe_progress()
    }

    pub fn is_migrating(&self) -> bool {
        self.coordinator.is_migrating()
    }

    pub fn latest_version(&self) -> u32 {
        self.coordinator.latest_version()
    }

    pub fn migration_history(&self) -> Vec<MigrationLogEntry> {
        self.coordinator.history()
    }

    /// Backup names, newest first.
    pub fn list_backups(&self) -> Result<Vec<String>, StoreError> {
        self.persistence
            .blob_store()
            .list_backups()
            .map_err(|e| StoreError::CorruptedData(format!("failed to list backups: {e}")))
    }

    pub fn identities(&self) -> &IdentityRepository {
        &self.identities
    }

    pub fn server_profiles(&self) -> &ServerProfileRepository {
        &self.server_profiles
    }

    pub fn projects(&self) -> &ProjectRepository {
        &self.projects
    }

    pub fn messages(&self) -> &MessageRepository {
        &self.messages
    }
}
