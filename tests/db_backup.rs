#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::fs;
use std::path::Path;

use storemend_lib::db::backup::{create_backup, try_backup};
use storemend_lib::db::manifest::{file_sha256, read_manifest};
use storemend_lib::db::schema::SCHEMA_VERSION;
use storemend_lib::{EngineConfig, StoreAccess};
use storemend_lib::db::wal_path;
use util::{count_rows, seed_canonical, seed_with_leftover_wal, write_garbage, FlakyStore, TempStore};

#[test]
fn backup_copies_store_and_writes_manifest() {
    let tmp = TempStore::new("store.db");
    seed_canonical(&tmp.path, 3);
    let store = tmp.store();

    let record = create_backup(&*store, &tmp.config()).expect("backup");
    let backup = Path::new(&record.path);
    assert!(backup.starts_with(tmp.backups_dir()));
    let name = backup.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("store-"), "{name}");
    assert!(name.ends_with(".db"), "{name}");
    assert!(!name.contains(':'), "{name}");

    let manifest = read_manifest(Path::new(&record.manifest_path)).expect("manifest");
    assert_eq!(manifest, record.manifest);
    assert_eq!(manifest.sha256, file_sha256(backup).unwrap());
    assert_eq!(manifest.size_bytes, fs::metadata(backup).unwrap().len());
    assert_eq!(manifest.schema_version, SCHEMA_VERSION);
    assert!(manifest.schema_hash.is_some());

    assert_eq!(count_rows(backup, "sessions"), 3);
}

#[test]
fn backup_includes_rows_still_in_the_wal() {
    let tmp = TempStore::new("wal.db");
    seed_canonical(&tmp.path, 1);
    let store = tmp.store();
    store
        .run_write_transaction(|tx| {
            tx.execute(
                "INSERT INTO key_value_store (key, value) VALUES ('pending', 'yes')",
                [],
            )?;
            Ok(())
        })
        .expect("write through store");

    let record = create_backup(&*store, &tmp.config()).expect("backup");
    assert_eq!(count_rows(Path::new(&record.path), "key_value_store"), 2);
}

#[test]
fn backup_folds_a_wal_left_by_another_process() {
    let tmp = TempStore::new("crashed.db");
    seed_with_leftover_wal(&tmp.path, 3);
    let store = tmp.store();

    let record = create_backup(&*store, &tmp.config()).expect("backup");

    let backup = Path::new(&record.path);
    assert_eq!(count_rows(backup, "key_value_store"), 4);
    assert!(!wal_path(backup).exists());
    assert_eq!(count_rows(&tmp.path, "key_value_store"), 4);
}

#[test]
fn wal_that_cannot_be_checkpointed_fails_the_backup() {
    let tmp = TempStore::new("garbage.db");
    write_garbage(&tmp.path);
    fs::write(wal_path(&tmp.path), b"frames that belong to nobody").unwrap();
    let store = tmp.store();

    let err = create_backup(&*store, &tmp.config()).expect_err("checkpoint fails");

    assert_eq!(err.code(), "DB_BACKUP/CHECKPOINT_FAILED");
    assert!(tmp.backup_files().is_empty());
    assert!(try_backup(&*store, &tmp.config()).is_none());
}

#[test]
fn repeated_backups_never_overwrite_each_other() {
    let tmp = TempStore::new("store.db");
    seed_canonical(&tmp.path, 1);
    let store = tmp.store();
    let config = tmp.config();

    let first = create_backup(&*store, &config).expect("first");
    let second = create_backup(&*store, &config).expect("second");
    let third = create_backup(&*store, &config).expect("third");

    assert_ne!(first.path, second.path);
    assert_ne!(second.path, third.path);
    assert_eq!(tmp.backup_files().len(), 3);
}

#[test]
fn default_backup_dir_sits_next_to_the_store() {
    let tmp = TempStore::new("store.db");
    seed_canonical(&tmp.path, 1);
    let store = tmp.store();

    let record = create_backup(&*store, &EngineConfig::default()).expect("backup");
    assert!(Path::new(&record.path).starts_with(tmp.dir.path().join("backups")));
}

#[test]
fn missing_source_fails_without_creating_files() {
    let tmp = TempStore::new("absent.db");
    let store = tmp.store();

    let err = create_backup(&*store, &tmp.config()).expect_err("no source");
    assert_eq!(err.code(), "DB_BACKUP/SOURCE_MISSING");
    assert!(try_backup(&*store, &tmp.config()).is_none());
    assert!(tmp.backup_files().is_empty());
}

#[test]
fn close_failure_aborts_before_copying() {
    let tmp = TempStore::new("store.db");
    seed_canonical(&tmp.path, 1);
    let store = FlakyStore::failing(&tmp.path);

    let err = create_backup(&store, &tmp.config()).expect_err("close fails");
    assert_eq!(err.code(), "DB_BACKUP/CLOSE_FAILED");
    assert_eq!(err.cause().map(|c| c.message()), Some("simulated close failure"));
    assert!(tmp.backup_files().is_empty());
}
