//! Schema migrations for the stored document
//!
//! This module handles:
//! - Registering version-to-version migrations and resolving paths between them
//! - Backing up the store before a run and applying each step in order
//! - Rolling back to a backup snapshot
//! - Keeping a bounded history of runs

pub mod builtin;
pub mod coordinator;
pub mod history;
pub mod registry;
pub mod step;

pub use coordinator::{
    MigrationCoordinator, MigrationOutcome, MigrationPlan, MigrationProgress, MigrationReport,
    MigrationState, PlannedStep, RollbackOutcome, RollbackReport, RunOptions,
};
pub use history::{MigrationHistory, MigrationLogEntry, MigrationOperation};
pub use registry::{Migration, MigrationRegistry, NoProgress, ProgressSink};
pub use step::MigrationStep;
