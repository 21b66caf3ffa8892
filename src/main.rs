mod cli;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::fs;
use std::path::Path;

use docvault::config::StoreConfig;
use docvault::logger;
use docvault::migration::{MigrationOutcome, MigrationPlan, RunOptions};
use docvault::paths::StorePaths;
use docvault::sanitize::sanitize_for_display;
use docvault::validation::ValidationResult;
use docvault::{DataStore, StoreError};

use crate::cli::{Cli, Commands, MigrateCommands};

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {}", describe(&err));
        std::process::exit(1);
    }
}

/// Taxonomy kind plus sanitized message for store failures; sanitized
/// context chain for everything else.
fn describe(err: &anyhow::Error) -> String {
    match err.downcast_ref::<StoreError>() {
        Some(store_error) => store_error.user_message(),
        None => sanitize_for_display(&format!("{err:#}")),
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logger::init(cli.debug);
    let paths = StorePaths::new(cli.store.as_deref())?;
    let config = StoreConfig::load(&paths)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(dispatch(cli.command, &paths, config))
}

async fn dispatch(command: Commands, paths: &StorePaths, config: StoreConfig) -> Result<()> {
    match command {
        Commands::Init => cmd_init(paths, config).await,
        Commands::Status => cmd_status(&open(paths, config)?).await,
        Commands::Validate => cmd_validate(&open(paths, config)?).await,
        Commands::Migrate(args) => {
            let store = open(paths, config)?;
            match args.command {
                MigrateCommands::Check { to } => cmd_migrate_check(&store, to).await,
                MigrateCommands::Run(args) => cmd_migrate_run(&store, args).await,
                MigrateCommands::Rollback { backup } => cmd_migrate_rollback(&store, backup.as_deref()).await,
                MigrateCommands::List => cmd_migrate_list(&store),
                MigrateCommands::History => cmd_migrate_history(&store),
            }
        }
        Commands::Export(args) => cmd_export(&open(paths, config)?, &args.path, args.force).await,
        Commands::Import(args) => cmd_import(&open(paths, config)?, &args.path).await,
    }
}

fn open(paths: &StorePaths, config: StoreConfig) -> Result<DataStore> {
    Ok(DataStore::open(paths, config)?)
}

async fn cmd_init(paths: &StorePaths, config: StoreConfig) -> Result<()> {
    let store = open(paths, config.clone())?;
    let document = store.initialize().await?;
    if !paths.config_path.exists() {
        config.save(paths)?;
    }
    println!(
        "Store ready at {} (version {})",
        paths.base_dir.display(),
        document.version
    );
    Ok(())
}

async fn cmd_status(store: &DataStore) -> Result<()> {
    let document = store.load().await?;
    let latest = store.latest_version();
    println!("Version: {}", document.version);
    println!("Latest known version: {latest}");
    println!("Contents: {}", document.counts());
    println!("Last modified: {}", document.last_modified.to_rfc3339());
    println!("Migrating: {}", if store.is_migrating() { "yes" } else { "no" });
    if document.version < latest {
        println!("Migration pending: run `docvault migrate run`");
    }
    Ok(())
}

async fn cmd_validate(store: &DataStore) -> Result<()> {
    match store.validate().await? {
        ValidationResult::Success => {
            println!("Document is valid");
            Ok(())
        }
        ValidationResult::Failure(errors) => {
            for error in &errors {
                println!("  - {}", sanitize_for_display(&error.to_string()));
            }
            Err(StoreError::ValidationFailure(errors).into())
        }
    }
}

async fn cmd_migrate_check(store: &DataStore, to: Option<u32>) -> Result<()> {
    let document = store.load().await?;
    let target = to.unwrap_or_else(|| store.latest_version());
    println!("Current version: {}", document.version);
    println!("Target version: {target}");
    match store.plan_migration(Some(target)).await? {
        MigrationPlan::NoActionRequired => println!("No migration needed"),
        MigrationPlan::MigrationRequired(steps) => {
            println!("Migration required ({} step(s)):", steps.len());
            for step in steps {
                println!(
                    "  {} -> {}  {}: {} (reversible: {}, ~{} unit(s) of work)",
                    step.from_version,
                    step.to_version,
                    step.name,
                    step.description,
                    step.reversible,
                    step.estimated_steps
                );
            }
        }
        MigrationPlan::Incompatible(reason) => {
            println!("{reason}");
            return Err(StoreError::MigrationNotFound {
                from: document.version,
                to: target,
            }
            .into());
        }
    }
    Ok(())
}

async fn cmd_migrate_run(store: &DataStore, args: cli::RunArgs) -> Result<()> {
    let options = RunOptions {
        target: args.to.unwrap_or_else(|| store.latest_version()),
        create_backup: !args.no_backup,
        force_validation: args.force_validation,
    };
    match store.migrate(options).await {
        MigrationOutcome::Success(report) => {
            println!(
                "Migrated from version {} to {} in {} ms",
                report.from_version,
                report.to_version,
                report.duration.as_millis()
            );
            for step in &report.steps {
                println!("  applied {step}");
            }
            match report.backup_filename {
                Some(name) => println!("Backup: {name}"),
                None => println!("Backup: none"),
            }
            Ok(())
        }
        MigrationOutcome::Skipped { version } => {
            println!("Already at version {version}; nothing to do");
            Ok(())
        }
        MigrationOutcome::Failure(error) => Err(error.into()),
    }
}

async fn cmd_migrate_rollback(store: &DataStore, backup: Option<&str>) -> Result<()> {
    let report = store.rollback(backup).await.into_result()?;
    match report.from_version {
        Some(from) => println!(
            "Restored {} (version {from} -> {})",
            report.backup, report.to_version
        ),
        None => println!("Restored {} (version {})", report.backup, report.to_version),
    }
    Ok(())
}

fn cmd_migrate_list(store: &DataStore) -> Result<()> {
    let backups = store.list_backups()?;
    if backups.is_empty() {
        println!("No backups");
        return Ok(());
    }
    for name in backups {
        println!("{name}");
    }
    Ok(())
}

fn cmd_migrate_history(store: &DataStore) -> Result<()> {
    let history = store.migration_history();
    if history.is_empty() {
        println!("No migrations recorded");
        return Ok(());
    }
    for entry in history {
        let result = if entry.success { "ok" } else { "failed" };
        let from = entry
            .from_version
            .map_or_else(|| "?".to_string(), |version| version.to_string());
        let mut line = format!(
            "{} {} {from} -> {} {} ({} ms)",
            entry.timestamp.to_rfc3339(),
            entry.operation,
            entry.to_version,
            result,
            entry.duration_ms
        );
        if let Some(backup) = &entry.backup_filename {
            line.push_str(&format!(" backup={backup}"));
        }
        if let Some(error) = &entry.error {
            line.push_str(&format!(" error: {}", sanitize_for_display(error)));
        }
        println!("{line}");
    }
    Ok(())
}

async fn cmd_export(store: &DataStore, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "Export file already exists. Use --force to overwrite."
        ));
    }
    let json = store.export_data().await?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, Permissions::from_mode(0o600))?;
    }
    println!("Exported document to {}", path.display());
    Ok(())
}

async fn cmd_import(store: &DataStore, path: &Path) -> Result<()> {
    let json = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let document = store.import_data(&json).await?;
    println!(
        "Imported version {} document: {}",
        document.version,
        document.counts()
    );
    Ok(())
}
