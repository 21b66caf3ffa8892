use chrono::Utc;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::history::{MigrationHistory, MigrationLogEntry, MigrationOperation};
use super::registry::{Migration, MigrationRegistry, ProgressSink};
use crate::blob_store::BlobStore;
use crate::errors::StoreError;
use crate::models::Document;
use crate::persistence::{PersistenceCore, PersistenceGuard, decode};
use crate::validation::{ValidationResult, validate_document, validate_migration_step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    #[default]
    Idle,
    Validating,
    Skipped,
    BackingUp,
    Migrating,
    FinalValidating,
    Completed,
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            MigrationState::Idle => "idle",
            MigrationState::Validating => "validating",
            MigrationState::Skipped => "skipped",
            MigrationState::BackingUp => "backing up",
            MigrationState::Migrating => "migrating",
            MigrationState::FinalValidating => "final validation",
            MigrationState::Completed => "completed",
            MigrationState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MigrationProgress {
    pub state: MigrationState,
    pub step_index: usize,
    pub total_steps: usize,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub steps: Vec<String>,
    pub duration: Duration,
    pub backup_filename: Option<String>,
    pub document: Arc<Document>,
}

/// Result of a migration run. Never an `Err`: every failure is classified
/// into [`StoreError`] and returned as `Failure`.
#[derive(Debug, Clone)]
pub enum MigrationOutcome {
    Success(MigrationReport),
    Skipped { version: u32 },
    Failure(StoreError),
}

impl MigrationOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, MigrationOutcome::Failure(_))
    }

    pub fn into_result(self) -> Result<Option<MigrationReport>, StoreError> {
        match self {
            MigrationOutcome::Success(report) => Ok(Some(report)),
            MigrationOutcome::Skipped { .. } => Ok(None),
            MigrationOutcome::Failure(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub backup: String,
    pub from_version: Option<u32>,
    pub to_version: u32,
    pub document: Arc<Document>,
}

#[derive(Debug, Clone)]
pub enum RollbackOutcome {
    Restored(RollbackReport),
    Failure(StoreError),
}

impl RollbackOutcome {
    pub fn into_result(self) -> Result<RollbackReport, StoreError> {
        match self {
            RollbackOutcome::Restored(report) => Ok(report),
            RollbackOutcome::Failure(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub name: String,
    pub description: String,
    pub from_version: u32,
    pub to_version: u32,
    pub reversible: bool,
    pub estimated_steps: usize,
}

/// What a run to a target would do, computed without mutating anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationPlan {
    NoActionRequired,
    MigrationRequired(Vec<PlannedStep>),
    Incompatible(String),
}

/// Options for one run.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub target: u32,
    pub create_backup: bool,
    pub force_validation: bool,
}

/// Drives migration runs and rollbacks. All work happens while holding the
/// persistence lock, so at most one run or rollback executes per store and
/// it never interleaves with ordinary reads and writes.
pub struct MigrationCoordinator {
    persistence: Arc<PersistenceCore>,
    registry: MigrationRegistry,
    history: Mutex<MigrationHistory>,
    history_key: String,
    progress: watch::Sender<MigrationProgress>,
    migrating: AtomicBool,
}

impl MigrationCoordinator {
    pub fn new(
        persistence: Arc<PersistenceCore>,
        registry: MigrationRegistry,
        history_key: impl Into<String>,
        history_limit: usize,
    ) -> Self {
        let (progress, _) = watch::channel(MigrationProgress::default());
        Self {
            persistence,
            registry,
            history: Mutex::new(MigrationHistory::new(history_limit)),
            history_key: history_key.into(),
            progress,
            migrating: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn latest_version(&self) -> u32 {
        self.registry.latest_version()
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::SeqCst)
    }

    /// Replay-latest stream of run progress.
    pub fn observe_progress(&self) -> watch::Receiver<MigrationProgress> {
        self.progress.subscribe()
    }

    pub fn history(&self) -> Vec<MigrationLogEntry> {
        self.history_lock().entries()
    }

    /// Replaces the in-memory history with what the store holds.
    pub fn reload_history(&self, store: &dyn BlobStore) {
        let mut history = self.history_lock();
        let limit = history.limit();
        *history = MigrationHistory::load(store, &self.history_key, limit);
        debug!(entries = history.len(), "migration history loaded");
    }

    /// Loads the current document and migrates it to `options.target`.
    pub async fn migrate(&self, options: RunOptions) -> MigrationOutcome {
        let mut guard = self.persistence.lock().await;
        let _flag = MigratingFlag::raise(&self.migrating);
        let document = match guard.load() {
            Ok(document) => document,
            Err(error) => {
                return self.fail(&guard, Instant::now(), (None, options.target), None, error);
            }
        };
        self.run(&mut guard, (*document).clone(), options).await
    }

    /// Migrates `document` with the lock already held by the caller; used
    /// during startup before anything is cached.
    pub async fn migrate_locked(
        &self,
        guard: &mut PersistenceGuard<'_>,
        document: Document,
        options: RunOptions,
    ) -> MigrationOutcome {
        let _flag = MigratingFlag::raise(&self.migrating);
        self.run(guard, document, options).await
    }

    /// Nothing is persisted unless every step and the final validation pass.
    /// Yields after each progress update so observers on the same runtime
    /// see every state while the lock is held.
    async fn run(
        &self,
        guard: &mut PersistenceGuard<'_>,
        document: Document,
        options: RunOptions,
    ) -> MigrationOutcome {
        let started = Instant::now();
        let from = document.version;
        let versions = (Some(from), options.target);
        info!(from, to = options.target, "migration requested");

        if options.force_validation || from < options.target {
            self.advance(MigrationState::Validating, 0, 0, "validating current document").await;
            if let ValidationResult::Failure(errors) = validate_document(&document) {
                return self.fail(guard, started, versions, None, StoreError::ValidationFailure(errors));
            }
        }

        if from == options.target {
            self.set_state(MigrationState::Skipped, 0, 0, &format!("already at version {from}"));
            debug!(version = from, "migration skipped");
            return MigrationOutcome::Skipped { version: from };
        }

        let path = self.registry.find_path(from, options.target);
        if path.is_empty() {
            let error = StoreError::MigrationNotFound { from, to: options.target };
            return self.fail(guard, started, versions, None, error);
        }

        let backup = if options.create_backup {
            self.advance(MigrationState::BackingUp, 0, path.len(), "creating backup").await;
            create_backup(guard.blob_store())
        } else {
            None
        };

        let migrated = match self.apply_path(&path, document).await {
            Ok(migrated) => migrated,
            Err(error) => return self.fail(guard, started, versions, backup, error),
        };

        self.advance(MigrationState::FinalValidating, path.len(), path.len(), "validating result").await;
        if let ValidationResult::Failure(errors) = validate_document(&migrated) {
            return self.fail(guard, started, versions, backup, StoreError::ValidationFailure(errors));
        }

        let saved = match guard.save(migrated) {
            Ok(saved) => saved,
            Err(error) => return self.fail(guard, started, versions, backup, error),
        };

        let duration = started.elapsed();
        self.record(
            guard.blob_store(),
            log_entry(versions, true, duration, backup.clone(), None, MigrationOperation::Migrate),
        );
        self.set_state(
            MigrationState::Completed,
            path.len(),
            path.len(),
            &format!("migrated to version {}", options.target),
        );
        info!(from, to = options.target, steps = path.len(), duration_ms = duration.as_millis() as u64, "migration completed");

        MigrationOutcome::Success(MigrationReport {
            from_version: from,
            to_version: options.target,
            steps: path.iter().map(|migration| migration.name().to_string()).collect(),
            duration,
            backup_filename: backup,
            document: saved,
        })
    }

    async fn apply_path(&self, path: &[Arc<dyn Migration>], document: Document) -> Result<Document, StoreError> {
        let total = path.len();
        let mut current = document;
        for (index, migration) in path.iter().enumerate() {
            if !migration.can_apply(&current) {
                return Err(StoreError::MigrationExecutionFailed {
                    migration: migration.name().to_string(),
                    reason: format!("cannot apply to a document at version {}", current.version),
                });
            }

            self.advance(MigrationState::Migrating, index, total, migration.description()).await;
            debug!(migration = migration.name(), step = index + 1, total, "applying migration");

            let before = current.clone();
            let sink = StepProgress {
                sender: &self.progress,
                index,
                total,
                name: migration.description(),
            };
            let applied = panic::catch_unwind(AssertUnwindSafe(|| migration.apply(current, &sink)));
            current = match applied {
                Ok(Ok(document)) => document,
                Ok(Err(err)) => {
                    return Err(StoreError::MigrationExecutionFailed {
                        migration: migration.name().to_string(),
                        reason: err.to_string(),
                    });
                }
                Err(payload) => {
                    return Err(StoreError::MigrationExecutionFailed {
                        migration: migration.name().to_string(),
                        reason: format!("migration panicked: {}", panic_message(payload.as_ref())),
                    });
                }
            };

            if let ValidationResult::Failure(errors) =
                validate_migration_step(&before, &current, migration.to_version())
            {
                warn!(migration = migration.name(), errors = errors.len(), "migration step failed validation");
                return Err(StoreError::ValidationFailure(errors));
            }
        }
        Ok(current)
    }

    /// Restores `backup`, or the newest backup recorded by a successful
    /// migration, or failing that the newest backup in the store.
    pub async fn rollback(&self, backup: Option<&str>) -> RollbackOutcome {
        let mut guard = self.persistence.lock().await;
        let _flag = MigratingFlag::raise(&self.migrating);
        let started = Instant::now();

        let name = match backup {
            Some(name) => name.to_string(),
            None => match self.default_backup(guard.blob_store()) {
                Ok(Some(name)) => name,
                Ok(None) => {
                    return self.fail_rollback(
                        &guard,
                        started,
                        None,
                        None,
                        StoreError::RollbackNotSupported("no backup has been recorded".to_string()),
                    );
                }
                Err(error) => return self.fail_rollback(&guard, started, None, None, error),
            },
        };

        info!(backup = %name, "rollback requested");
        self.advance(MigrationState::Validating, 0, 1, &format!("restoring {name}")).await;

        let snapshot = match guard.raw() {
            Ok(snapshot) => snapshot,
            Err(error) => return self.fail_rollback(&guard, started, None, Some(name), error),
        };
        let previous_version = snapshot
            .as_deref()
            .and_then(|bytes| decode(bytes).ok())
            .map(|document| document.version);

        match guard.blob_store().restore_backup(&name) {
            Ok(true) => {}
            Ok(false) => {
                let error = StoreError::RollbackFailed(format!("backup '{name}' does not exist"));
                return self.fail_rollback(&guard, started, previous_version, Some(name), error);
            }
            Err(err) => {
                let error = StoreError::RollbackFailed(err.to_string());
                return self.fail_rollback(&guard, started, previous_version, Some(name), error);
            }
        }

        let restored = match guard.reload() {
            Ok(document) => document,
            Err(error) => {
                warn!(backup = %name, error = %error, "restored backup is unusable; putting back previous document");
                if let Err(put_back) = guard.restore_raw(snapshot.as_deref()) {
                    error!(error = %put_back, "failed to put back document after rollback failure");
                }
                if let Err(reload) = guard.load() {
                    warn!(error = %reload, "failed to reload document after putting it back");
                }
                let error = StoreError::RollbackFailed(format!("backup '{name}' failed validation: {error}"));
                return self.fail_rollback(&guard, started, previous_version, Some(name), error);
            }
        };

        let duration = started.elapsed();
        self.record(
            guard.blob_store(),
            log_entry(
                (previous_version, restored.version),
                true,
                duration,
                Some(name.clone()),
                None,
                MigrationOperation::Rollback,
            ),
        );
        self.set_state(
            MigrationState::Completed,
            1,
            1,
            &format!("restored version {} from {name}", restored.version),
        );
        info!(backup = %name, version = restored.version, "rollback completed");

        RollbackOutcome::Restored(RollbackReport {
            backup: name,
            from_version: previous_version,
            to_version: restored.version,
            document: restored,
        })
    }

    /// Newest backup recorded by a successful migration that the store still
    /// holds; otherwise the newest backup in the store.
    fn default_backup(&self, store: &dyn BlobStore) -> Result<Option<String>, StoreError> {
        let available = store
            .list_backups()
            .map_err(|err| StoreError::RollbackFailed(format!("failed to list backups: {err}")))?;
        let history = self.history_lock();
        let mut recorded = history.migration_backups().peekable();
        let pruned = recorded.peek().is_some();
        if let Some(name) = recorded.find(|name| available.iter().any(|candidate| candidate == name)) {
            return Ok(Some(name.to_string()));
        }
        if pruned {
            debug!("recorded backups were pruned; using newest available backup");
        }
        Ok(available.into_iter().next())
    }

    /// Describes a run from `document` to `target` without performing it.
    pub fn plan(&self, document: &Document, target: u32) -> MigrationPlan {
        if document.version == target {
            return MigrationPlan::NoActionRequired;
        }
        let path = self.registry.find_path(document.version, target);
        if path.is_empty() {
            return MigrationPlan::Incompatible(format!(
                "no migration path from version {} to version {target}",
                document.version
            ));
        }
        MigrationPlan::MigrationRequired(
            path.iter()
                .map(|migration| PlannedStep {
                    name: migration.name().to_string(),
                    description: migration.description().to_string(),
                    from_version: migration.from_version(),
                    to_version: migration.to_version(),
                    reversible: migration.reversible(),
                    estimated_steps: migration.estimate_steps(document),
                })
                .collect(),
        )
    }

    fn fail(
        &self,
        guard: &PersistenceGuard<'_>,
        started: Instant,
        versions: (Option<u32>, u32),
        backup: Option<String>,
        error: StoreError,
    ) -> MigrationOutcome {
        error!(from = ?versions.0, to = versions.1, kind = %error.kind(), error = %error, "migration failed");
        self.record(
            guard.blob_store(),
            log_entry(
                versions,
                false,
                started.elapsed(),
                backup,
                Some(error.to_string()),
                MigrationOperation::Migrate,
            ),
        );
        self.set_state(MigrationState::Failed, 0, 0, &error.user_message());
        MigrationOutcome::Failure(error)
    }

    fn fail_rollback(
        &self,
        guard: &PersistenceGuard<'_>,
        started: Instant,
        from: Option<u32>,
        backup: Option<String>,
        error: StoreError,
    ) -> RollbackOutcome {
        error!(kind = %error.kind(), error = %error, "rollback failed");
        self.record(
            guard.blob_store(),
            log_entry(
                (from, from.unwrap_or_default()),
                false,
                started.elapsed(),
                backup,
                Some(error.to_string()),
                MigrationOperation::Rollback,
            ),
        );
        self.set_state(MigrationState::Failed, 0, 0, &error.user_message());
        RollbackOutcome::Failure(error)
    }

    fn record(&self, store: &dyn BlobStore, entry: MigrationLogEntry) {
        let mut history = self.history_lock();
        history.push(entry);
        if let Err(err) = history.persist(store, &self.history_key) {
            warn!(error = %err, "failed to persist migration history");
        }
    }

    fn set_state(&self, state: MigrationState, step_index: usize, total_steps: usize, description: &str) {
        self.progress.send_replace(MigrationProgress {
            state,
            step_index,
            total_steps,
            description: description.to_string(),
        });
    }

    async fn advance(&self, state: MigrationState, step_index: usize, total_steps: usize, description: &str) {
        self.set_state(state, step_index, total_steps, description);
        tokio::task::yield_now().await;
    }

    fn history_lock(&self) -> MutexGuard<'_, MigrationHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A backup failure degrades the run but does not stop it.
fn create_backup(store: &dyn BlobStore) -> Option<String> {
    match store.create_backup() {
        Ok(Some(name)) => {
            info!(backup = %name, "backup created before migration");
            Some(name)
        }
        Ok(None) => {
            warn!("nothing to back up before migration");
            None
        }
        Err(err) => {
            warn!(error = %err, "backup failed; continuing migration without one");
            None
        }
    }
}

fn log_entry(
    (from, to): (Option<u32>, u32),
    success: bool,
    duration: Duration,
    backup_filename: Option<String>,
    error: Option<String>,
    operation: MigrationOperation,
) -> MigrationLogEntry {
    MigrationLogEntry {
        timestamp: Utc::now(),
        from_version: from,
        to_version: to,
        success,
        duration_ms: duration.as_millis() as u64,
        backup_filename,
        error,
        operation,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Forwards a migration's own progress reports as `Migrating` updates.
struct StepProgress<'a> {
    sender: &'a watch::Sender<MigrationProgress>,
    index: usize,
    total: usize,
    name: &'a str,
}

impl ProgressSink for StepProgress<'_> {
    fn report(&self, completed: usize, total: usize, detail: &str) {
        self.sender.send_replace(MigrationProgress {
            state: MigrationState::Migrating,
            step_index: self.index,
            total_steps: self.total,
            description: format!("{}: {detail} ({completed}/{total})", self.name),
        });
    }
}

/// Holds `is_migrating` high for the lifetime of a run.
struct MigratingFlag<'a>(&'a AtomicBool);

impl<'a> MigratingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for MigratingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;
    use crate::errors::{ErrorKind, MigrationError};
    use crate::migration::step::MigrationStep;
    use crate::models::{Identity, KeyType};

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGq3 dev@laptop";

    fn setup(registry: MigrationRegistry) -> (Arc<MemoryBlobStore>, Arc<PersistenceCore>, MigrationCoordinator) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let persistence = Arc::new(PersistenceCore::new(blobs.clone(), "app_document"));
        let coordinator = MigrationCoordinator::new(Arc::clone(&persistence), registry, "migration_history", 50);
        (blobs, persistence, coordinator)
    }

    fn bump(from: u32, to: u32) -> MigrationStep {
        MigrationStep::new(format!("bump_{from}_{to}"), from, to, |doc, _| Ok(doc))
    }

    fn options(target: u32) -> RunOptions {
        RunOptions {
            target,
            create_backup: true,
            force_validation: false,
        }
    }

    #[tokio::test]
    async fn test_runs_path_and_records_history() {
        let mut registry = MigrationRegistry::new();
        registry.register(bump(1, 2)).unwrap();
        registry.register(bump(2, 3)).unwrap();
        let (blobs, persistence, coordinator) = setup(registry);
        persistence.save(Document::new()).await.unwrap();

        let report = coordinator.migrate(options(3)).await.into_result().unwrap().unwrap();
        assert_eq!(report.steps, vec!["bump_1_2", "bump_2_3"]);
        assert_eq!(persistence.load().await.unwrap().version, 3);
        assert!(report.backup_filename.is_some());
        assert_eq!(blobs.list_backups().unwrap().len(), 1);

        let history = coordinator.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert!(!coordinator.is_migrating());
        assert_eq!(coordinator.observe_progress().borrow().state, MigrationState::Completed);
    }

    #[tokio::test]
    async fn test_same_version_is_skipped() {
        let (_, persistence, coordinator) = setup(MigrationRegistry::new());
        persistence.save(Document::new()).await.unwrap();
        assert!(matches!(
            coordinator.migrate(options(1)).await,
            MigrationOutcome::Skipped { version: 1 }
        ));
        assert!(coordinator.history().is_empty());
    }

    #[tokio::test]
    async fn test_missing_path() {
        let (_, persistence, coordinator) = setup(MigrationRegistry::new());
        persistence.save(Document::new()).await.unwrap();
        let outcome = coordinator.migrate(options(4)).await;
        match outcome {
            MigrationOutcome::Failure(error) => assert_eq!(error.kind(), ErrorKind::MigrationNotFound),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!coordinator.history()[0].success);
    }

    #[tokio::test]
    async fn test_failed_step_leaves_document_untouched() {
        let mut registry = MigrationRegistry::new();
        registry.register(bump(1, 2)).unwrap();
        registry
            .register(MigrationStep::new("explode", 2, 3, |_, _| Err(MigrationError::new("boom"))))
            .unwrap();
        let (blobs, persistence, coordinator) = setup(registry);
        persistence.save(Document::new()).await.unwrap();
        let before = blobs.get("app_document").unwrap();

        let outcome = coordinator.migrate(options(3)).await;
        assert!(matches!(
            outcome,
            MigrationOutcome::Failure(StoreError::MigrationExecutionFailed { .. })
        ));
        assert_eq!(blobs.get("app_document").unwrap(), before);
        assert_eq!(persistence.load().await.unwrap().version, 1);
        assert_eq!(coordinator.observe_progress().borrow().state, MigrationState::Failed);
    }

    #[tokio::test]
    async fn test_panicking_step_becomes_failure() {
        let mut registry = MigrationRegistry::new();
        registry
            .register(MigrationStep::new("panics", 1, 2, |_, _| panic!("bad data")))
            .unwrap();
        let (_, persistence, coordinator) = setup(registry);
        persistence.save(Document::new()).await.unwrap();

        match coordinator.migrate(options(2)).await {
            MigrationOutcome::Failure(StoreError::MigrationExecutionFailed { reason, .. }) => {
                assert!(reason.contains("bad data"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!coordinator.is_migrating());
    }

    #[tokio::test]
    async fn test_data_loss_is_rejected() {
        let mut registry = MigrationRegistry::new();
        registry
            .register(MigrationStep::new("drop_identities", 1, 2, |mut doc, _| {
                doc.identities.clear();
                Ok(doc)
            }))
            .unwrap();
        let (_, persistence, coordinator) = setup(registry);
        let mut doc = Document::new();
        doc.identities.push(Identity::new("Dev", KeyType::Ed25519, KEY));
        persistence.save(doc).await.unwrap();

        let outcome = coordinator.migrate(options(2)).await;
        assert!(matches!(outcome, MigrationOutcome::Failure(StoreError::ValidationFailure(_))));
        assert_eq!(persistence.load().await.unwrap().identities.len(), 1);
    }

    #[tokio::test]
    async fn test_backup_failure_is_not_fatal() {
        let mut registry = MigrationRegistry::new();
        registry.register(bump(1, 2)).unwrap();
        let (blobs, persistence, coordinator) = setup(registry);
        persistence.save(Document::new()).await.unwrap();
        blobs.fail_backups(true);

        let report = coordinator.migrate(options(2)).await.into_result().unwrap().unwrap();
        assert_eq!(report.backup_filename, None);
        assert_eq!(report.document.version, 2);
    }

    #[tokio::test]
    async fn test_rollback_restores_backup() {
        let mut registry = MigrationRegistry::new();
        registry.register(bump(1, 2)).unwrap();
        let (_, persistence, coordinator) = setup(registry);
        persistence.save(Document::new()).await.unwrap();
        coordinator.migrate(options(2)).await.into_result().unwrap();

        let report = coordinator.rollback(None).await.into_result().unwrap();
        assert_eq!(report.to_version, 1);
        assert_eq!(report.from_version, Some(2));
        assert_eq!(persistence.load().await.unwrap().version, 1);

        let history = coordinator.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].operation, MigrationOperation::Rollback);
    }

    #[tokio::test]
    async fn test_rollback_without_backup() {
        let (_, persistence, coordinator) = setup(MigrationRegistry::new());
        persistence.save(Document::new()).await.unwrap();
        let error = coordinator.rollback(None).await.into_result().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::RollbackNotSupported);

        let error = coordinator.rollback(Some("backup_missing")).await.into_result().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::RollbackFailed);
    }

    #[tokio::test]
    async fn test_rollback_skips_pruned_backups() {
        let mut registry = MigrationRegistry::new();
        registry.register(bump(1, 2)).unwrap();
        let (blobs, persistence, coordinator) = setup(registry);
        persistence.save(Document::new()).await.unwrap();
        let kept = coordinator
            .migrate(options(2))
            .await
            .into_result()
            .unwrap()
            .and_then(|report| report.backup_filename)
            .unwrap();
        coordinator.record(
            &*blobs,
            log_entry(
                (Some(2), 3),
                true,
                Duration::ZERO,
                Some("backup_pruned".to_string()),
                None,
                MigrationOperation::Migrate,
            ),
        );

        let report = coordinator.rollback(None).await.into_result().unwrap();
        assert_eq!(report.backup, kept);
        assert_eq!(report.to_version, 1);
    }

    #[tokio::test]
    async fn test_unusable_backup_puts_previous_document_back() {
        let (blobs, persistence, coordinator) = setup(MigrationRegistry::new());
        blobs.put("app_document", b"{not json").unwrap();
        let broken = blobs.create_backup().unwrap().unwrap();
        let mut doc = Document::new();
        doc.identities.push(Identity::new("Dev", KeyType::Ed25519, KEY));
        persistence.save(doc).await.unwrap();

        let error = coordinator.rollback(Some(&broken)).await.into_result().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::RollbackFailed);
        assert_eq!(persistence.load().await.unwrap().identities.len(), 1);
        assert_eq!(coordinator.history()[0].from_version, Some(1));
    }

    #[tokio::test]
    async fn test_progress_reports_each_step_while_running() {
        let mut registry = MigrationRegistry::new();
        registry.register(bump(1, 2).describe("first step")).unwrap();
        registry.register(bump(2, 3).describe("second step")).unwrap();
        let (_, persistence, coordinator) = setup(registry);
        persistence.save(Document::new()).await.unwrap();
        let coordinator = Arc::new(coordinator);

        let mut progress = coordinator.observe_progress();
        let watcher = Arc::clone(&coordinator);
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while progress.changed().await.is_ok() {
                let update = progress.borrow_and_update().clone();
                let finished = matches!(update.state, MigrationState::Completed | MigrationState::Failed);
                seen.push((update, watcher.is_migrating()));
                if finished {
                    break;
                }
            }
            seen
        });

        coordinator.migrate(options(3)).await.into_result().unwrap();
        let seen = collector.await.unwrap();

        let states: Vec<MigrationState> = seen.iter().map(|(update, _)| update.state).collect();
        assert_eq!(
            states,
            vec![
                MigrationState::Validating,
                MigrationState::BackingUp,
                MigrationState::Migrating,
                MigrationState::Migrating,
                MigrationState::FinalValidating,
                MigrationState::Completed,
            ]
        );
        let steps: Vec<(usize, usize, &str)> = seen
            .iter()
            .filter(|(update, _)| update.state == MigrationState::Migrating)
            .map(|(update, _)| (update.step_index, update.total_steps, update.description.as_str()))
            .collect();
        assert_eq!(steps, vec![(0, 2, "first step"), (1, 2, "second step")]);
        assert!(seen[..5].iter().all(|(_, migrating)| *migrating));
    }

    #[tokio::test]
    async fn test_unreadable_document_records_no_source_version() {
        let (_, _, coordinator) = setup(MigrationRegistry::new());
        let error = coordinator.migrate(options(2)).await.into_result().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Initialization);

        let history = coordinator.history();
        assert_eq!(history[0].from_version, None);
        assert_eq!(history[0].to_version, 2);
        assert!(!history[0].success);
    }

    #[tokio::test]
    async fn test_plan() {
        let mut registry = MigrationRegistry::new();
        registry.register(bump(1, 2).reversible(true)).unwrap();
        let (_, _, coordinator) = setup(registry);
        let doc = Document::new();

        assert_eq!(coordinator.plan(&doc, 1), MigrationPlan::NoActionRequired);
        match coordinator.plan(&doc, 2) {
            MigrationPlan::MigrationRequired(steps) => {
                assert_eq!(steps.len(), 1);
                assert!(steps[0].reversible);
            }
            other => panic!("unexpected plan {other:?}"),
        }
        assert!(matches!(coordinator.plan(&doc, 9), MigrationPlan::Incompatible(_)));
    }
}
