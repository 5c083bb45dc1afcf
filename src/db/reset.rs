use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::config::EngineConfig;
use crate::{AppError, AppResult};

use super::backup::create_backup;
use super::schema::CANONICAL_SCHEMA;
use super::{shm_path, wal_path, StoreAccess};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub backup_path: String,
    pub removed_files: Vec<String>,
    /// Whether a fresh canonical schema was written after the wipe.
    pub reinitialized: bool,
}

/// Deletes the store and its WAL/SHM companions, then writes an empty
/// canonical schema. Refuses to delete anything without a fresh backup.
pub fn reset_store<S: StoreAccess>(store: &S, config: &EngineConfig) -> AppResult<ResetReport> {
    let backup = create_backup(store, config).map_err(|err| {
        AppError::new(
            "DB_RESET/BACKUP_FAILED",
            "Defensive backup failed; reset aborted",
        )
        .with_cause(err)
    })?;

    store.close_all_connections().map_err(|err| {
        AppError::new("DB_RESET/CLOSE_FAILED", "Could not close store connections").with_cause(err)
    })?;

    let db_path = store.db_path();
    let mut removed_files = Vec::new();
    for path in [db_path.to_path_buf(), wal_path(db_path), shm_path(db_path)] {
        if remove_if_present(&path)? {
            removed_files.push(path.display().to_string());
        }
    }
    tracing::warn!(
        target: "storemend",
        event = "db_reset_removed",
        path = %db_path.display(),
        removed = removed_files.len(),
        backup = %backup.path
    );

    let reinitialized = match store.run_write_transaction(|tx| {
        tx.execute_batch(CANONICAL_SCHEMA)?;
        Ok(())
    }) {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(
                target: "storemend",
                event = "db_reset_reinit_failed",
                path = %db_path.display(),
                error = %err
            );
            false
        }
    };

    Ok(ResetReport {
        backup_path: backup.path,
        removed_files,
        reinitialized,
    })
}

fn remove_if_present(path: &Path) -> AppResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AppError::new("DB_RESET/REMOVE_FAILED", "Failed to remove store file")
            .with_context("path", path.display().to_string())
            .with_cause(err)),
    }
}
