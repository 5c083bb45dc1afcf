use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::available_space;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::config::EngineConfig;
use crate::{AppError, AppResult};

use super::manifest::{self, BackupManifest};
use super::{wal_path, StoreAccess};

const MAX_NAME_ATTEMPTS: u32 = 100;

/// A finished backup copy and its manifest.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub path: String,
    pub manifest_path: String,
    pub manifest: BackupManifest,
}

/// Copies the primary store file into the backups directory.
///
/// All connections are closed before the copy so the file is not being
/// written while it is read. Only the primary file is copied, so any
/// committed WAL frames are checkpointed into it first, including a `-wal`
/// left behind by a process that exited without checkpointing. A WAL that
/// cannot be folded in fails the backup.
pub fn create_backup<S: StoreAccess>(store: &S, config: &EngineConfig) -> AppResult<BackupRecord> {
    let db_path = store.db_path();
    let db_meta = fs::metadata(db_path).map_err(|err| {
        AppError::new("DB_BACKUP/SOURCE_MISSING", "Store file does not exist")
            .with_context("path", db_path.display().to_string())
            .with_cause(err)
    })?;
    if !db_meta.is_file() {
        return Err(
            AppError::new("DB_BACKUP/SOURCE_MISSING", "Store path is not a file")
                .with_context("path", db_path.display().to_string()),
        );
    }

    let root = config.backup_root(db_path)?;
    fs::create_dir_all(&root).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_backups_dir")
            .with_context("path", root.display().to_string())
    })?;

    let schema_hash = store
        .run_read_only(|conn| Ok(manifest::schema_hash(conn)?))
        .ok();

    store.close_all_connections().map_err(|err| {
        AppError::new(
            "DB_BACKUP/CLOSE_FAILED",
            "Could not close store connections before backup",
        )
        .with_cause(err)
    })?;
    checkpoint_leftover_wal(db_path)?;

    // Checkpointing may have grown the file.
    let db_size = fs::metadata(db_path)
        .map(|meta| meta.len())
        .unwrap_or(db_meta.len());
    let required = required_free_bytes(db_size, config.free_space_multiplier);
    let available = free_disk_space(&root)?;
    if available < required {
        return Err(AppError::new(
            "DB_BACKUP/LOW_DISK",
            format!("Not enough disk space for backup (need {required} bytes)."),
        )
        .with_context("available_bytes", available.to_string())
        .with_context("required_bytes", required.to_string()));
    }

    let target = unique_backup_path(&root, db_path, &Utc::now())?;
    let result = copy_and_describe(db_path, &target, schema_hash);
    if result.is_err() {
        let _ = fs::remove_file(&target);
        let _ = fs::remove_file(manifest::manifest_path_for(&target));
    }
    let record = result?;

    tracing::info!(
        target: "storemend",
        event = "db_backup_created",
        path = %record.path,
        size_bytes = record.manifest.size_bytes,
        sha256 = %record.manifest.sha256
    );
    Ok(record)
}

/// Folds a non-empty `-wal` sidecar into the primary file.
fn checkpoint_leftover_wal(db_path: &Path) -> AppResult<()> {
    let wal = wal_path(db_path);
    let wal_len = fs::metadata(&wal).map(|meta| meta.len()).unwrap_or(0);
    if wal_len == 0 {
        return Ok(());
    }

    let failed = |operation: &str, err: rusqlite::Error| {
        AppError::new(
            "DB_BACKUP/CHECKPOINT_FAILED",
            "Could not checkpoint the WAL into the store before backup",
        )
        .with_context("operation", operation.to_string())
        .with_context("wal_path", wal.display().to_string())
        .with_cause(err)
    };

    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| failed("open", err))?;
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(|err| failed("busy_timeout", err))?;
    let (busy, log_frames, checkpointed): (i64, i64, i64) = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .map_err(|err| failed("wal_checkpoint", err))?;
    conn.close().map_err(|(_, err)| failed("close", err))?;

    if busy != 0 || checkpointed < log_frames {
        return Err(AppError::new(
            "DB_BACKUP/CHECKPOINT_FAILED",
            "WAL checkpoint did not complete; another connection may hold the store",
        )
        .with_context("wal_path", wal.display().to_string())
        .with_context("busy", busy.to_string())
        .with_context("log_frames", log_frames.to_string())
        .with_context("checkpointed_frames", checkpointed.to_string()));
    }

    tracing::info!(
        target: "storemend",
        event = "db_wal_checkpointed",
        path = %db_path.display(),
        wal_bytes = wal_len
    );
    Ok(())
}

/// [`create_backup`] with failures logged and reduced to `None`.
pub fn try_backup<S: StoreAccess>(store: &S, config: &EngineConfig) -> Option<PathBuf> {
    match create_backup(store, config) {
        Ok(record) => Some(PathBuf::from(record.path)),
        Err(err) => {
            tracing::error!(
                target: "storemend",
                event = "db_backup_failed",
                path = %store.db_path().display(),
                error = %err
            );
            None
        }
    }
}

fn copy_and_describe(
    db_path: &Path,
    target: &Path,
    schema_hash: Option<String>,
) -> AppResult<BackupRecord> {
    fs::copy(db_path, target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_store")
            .with_context("from", db_path.display().to_string())
            .with_context("to", target.display().to_string())
    })?;
    File::open(target)
        .and_then(|file| file.sync_all())
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "sync_backup")
                .with_context("path", target.display().to_string())
        })?;

    let sha = manifest::file_sha256(target)?;
    let size = fs::metadata(target).map(|meta| meta.len()).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "backup_metadata")
            .with_context("path", target.display().to_string())
    })?;
    let manifest = BackupManifest::new(db_path, size, sha, schema_hash);

    let manifest_path = manifest::manifest_path_for(target);
    let payload = serde_json::to_vec_pretty(&manifest)
        .map_err(|err| AppError::from(err).with_context("operation", "serialize_manifest"))?;
    fs::write(&manifest_path, payload).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_manifest")
            .with_context("path", manifest_path.display().to_string())
    })?;
    if let Some(parent) = target.parent() {
        sync_dir(parent).ok();
    }

    Ok(BackupRecord {
        path: target.display().to_string(),
        manifest_path: manifest_path.display().to_string(),
        manifest,
    })
}

fn required_free_bytes(db_size: u64, multiplier: f64) -> u64 {
    (db_size as f64 * multiplier).ceil() as u64
}

fn free_disk_space(path: &Path) -> AppResult<u64> {
    available_space(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", path.display().to_string())
    })
}

/// Lexically sortable stamp: RFC 3339 millis with `:` and `.` replaced.
pub fn backup_timestamp(now: &DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

fn unique_backup_path(root: &Path, db_path: &Path, now: &DateTime<Utc>) -> AppResult<PathBuf> {
    let stem = db_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let ext = db_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let base = format!("{stem}-{}", backup_timestamp(now));

    for suffix in 0..MAX_NAME_ATTEMPTS {
        let candidate = root.join(format!("{base}-{suffix:02}{ext}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(AppError::new(
        "DB_BACKUP/NAME_COLLISION",
        "Unable to allocate a unique backup file name",
    )
    .with_context("base", base))
}

fn sync_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}
