use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::path::Path;
use tempfile::tempdir;

fn docvault(store: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("docvault");
    cmd.env("HOME", store).env_remove("DOCVAULT_LOG").arg("--store").arg(store);
    cmd
}

#[test]
fn test_init_then_status() {
    let temp = tempdir().unwrap();
    let store = temp.path().join("vault");

    docvault(&store)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("(version 2)"));
    assert!(store.join("config.json").exists());
    assert!(store.join("data").join("app_document.bin").exists());

    docvault(&store)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Version: 2"))
        .stdout(predicate::str::contains("0 identities"))
        .stdout(predicate::str::contains("Migrating: no"));

    docvault(&store)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Document is valid"));
}

#[test]
fn test_status_before_init_reports_initialization() {
    let temp = tempdir().unwrap();
    docvault(temp.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error: initialization:"));
}

#[test]
fn test_migration_history_backups_and_rollback() {
    let temp = tempdir().unwrap();
    let store = temp.path();
    docvault(store).arg("init").assert().success();

    docvault(store)
        .args(["migrate", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No migration needed"));

    docvault(store)
        .args(["migrate", "history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("migrate 1 -> 2 ok"));

    docvault(store)
        .args(["migrate", "list"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("backup_"));

    docvault(store)
        .args(["migrate", "rollback"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(version 2 -> 1)"));

    docvault(store)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Version: 1"))
        .stdout(predicate::str::contains("Migration pending"));

    docvault(store)
        .args(["migrate", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("backfill_project_activity"));

    docvault(store)
        .args(["migrate", "run", "--no-backup"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Migrated from version 1 to 2"))
        .stdout(predicate::str::contains("Backup: none"));

    docvault(store)
        .args(["migrate", "run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Already at version 2"));
}

#[test]
fn test_migrate_to_unknown_version_fails() {
    let temp = tempdir().unwrap();
    let store = temp.path();
    docvault(store).arg("init").assert().success();

    docvault(store)
        .args(["migrate", "run", "--to", "7"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("migration not found"));
}

#[test]
fn test_export_and_import() {
    let temp = tempdir().unwrap();
    let store = temp.path().join("vault");
    let export = temp.path().join("export.json");
    docvault(&store).arg("init").assert().success();

    docvault(&store)
        .arg("export")
        .arg(&export)
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported document"));
    let json = std::fs::read_to_string(&export).unwrap();
    assert!(json.contains("\"serverProfiles\""));

    docvault(&store)
        .arg("export")
        .arg(&export)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    docvault(&store)
        .arg("export")
        .arg(&export)
        .arg("--force")
        .assert()
        .success();

    let other = temp.path().join("other");
    docvault(&other)
        .arg("import")
        .arg(&export)
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported version 2 document"));
}

#[test]
fn test_import_rejects_corrupted_json() {
    let temp = tempdir().unwrap();
    let store = temp.path().join("vault");
    let bad = temp.path().join("bad.json");
    std::fs::write(&bad, "{ not json").unwrap();
    docvault(&store).arg("init").assert().success();

    docvault(&store)
        .arg("import")
        .arg(&bad)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error: corrupted data:"));

    docvault(&store)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Version: 2"));
}

#[test]
fn test_import_rejects_dangling_reference() {
    let temp = tempdir().unwrap();
    let store = temp.path().join("vault");
    let file = temp.path().join("dangling.json");
    let json = r#"{
        "version": 2,
        "serverProfiles": [{
            "id": "p1",
            "name": "orphan",
            "host": "orphan.example.com",
            "port": 22,
            "username": "root",
            "sshIdentityId": "x",
            "createdAt": "2024-01-01T00:00:00Z"
        }]
    }"#;
    std::fs::write(&file, json).unwrap();
    docvault(&store).arg("init").assert().success();

    docvault(&store)
        .arg("import")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error: validation failure:"))
        .stderr(predicate::str::contains("sshIdentityId"));
}
