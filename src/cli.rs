use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "docvault",
    version,
    about = "Versioned, validated document store with migrations and rollback."
)]
pub struct Cli {
    /// Store directory (defaults to ~/.docvault)
    #[arg(long, global = true, value_name = "DIR")]
    pub store: Option<PathBuf>,
    /// Verbose logging to stderr
    #[arg(long, global = true)]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the store if needed and bring it to the latest version
    Init,
    /// Show version, entity counts and migration state
    Status,
    /// Run full document validation
    Validate,
    Migrate(MigrateArgs),
    Export(ExportArgs),
    Import(ImportArgs),
}

#[derive(Args)]
pub struct MigrateArgs {
    #[command(subcommand)]
    pub command: MigrateCommands,
}

#[derive(Subcommand)]
pub enum MigrateCommands {
    /// Show what a migration would do without running it
    Check {
        #[arg(long)]
        to: Option<u32>,
    },
    Run(RunArgs),
    /// Restore a backup (default: the one taken by the last migration)
    Rollback {
        #[arg(long)]
        backup: Option<String>,
    },
    /// List backups, newest first
    List,
    /// Show recent migration and rollback runs
    History,
}

#[derive(Args)]
pub struct RunArgs {
    /// Target version (default: latest)
    #[arg(long)]
    pub to: Option<u32>,
    /// Skip the pre-migration backup
    #[arg(long)]
    pub no_backup: bool,
    /// Validate even when already at the target version
    #[arg(long)]
    pub force_validation: bool,
}

#[derive(Args)]
pub struct ExportArgs {
    pub path: PathBuf,
    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct ImportArgs {
    pub path: PathBuf,
}
