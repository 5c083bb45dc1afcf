use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};

use crate::{AppError, AppResult};

pub mod backup;
pub mod health;
pub mod manifest;
pub mod rebuild;
pub mod recovery;
pub mod repair_tool;
pub mod reset;
pub mod schema;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Connection lifecycle the recovery engine relies on.
///
/// Implementations serialize writers and reopen connections lazily after
/// [`StoreAccess::close_all_connections`].
pub trait StoreAccess: Send + Sync + 'static {
    /// Location of the primary store file.
    fn db_path(&self) -> &Path;

    /// Runs `f` on a connection that cannot write to the store.
    fn run_read_only<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>;

    /// Runs `f` inside an immediate write transaction, committing on `Ok`.
    fn run_write_transaction<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> AppResult<T>;

    /// Runs `f` on the writer connection outside any transaction.
    fn run_exclusive<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>;

    fn close_all_connections(&self) -> AppResult<()>;
}

/// rusqlite-backed store: one lazily opened writer, a fresh reader per call.
pub struct SqliteStore {
    path: PathBuf,
    writer: Mutex<Option<Connection>>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    fn lock_writer(&self) -> AppResult<MutexGuard<'_, Option<Connection>>> {
        self.writer.lock().map_err(|_| {
            AppError::new("DB_STORE/POISONED", "Writer connection lock poisoned")
                .with_context("path", self.path.display().to_string())
        })
    }

    fn writer<'a>(
        &self,
        guard: &'a mut MutexGuard<'_, Option<Connection>>,
    ) -> AppResult<&'a mut Connection> {
        if guard.is_none() {
            **guard = Some(open_writer(&self.path)?);
        }
        guard.as_mut().ok_or_else(|| {
            AppError::new("DB_STORE/OPEN", "Writer connection unavailable")
                .with_context("path", self.path.display().to_string())
        })
    }
}

impl StoreAccess for SqliteStore {
    fn db_path(&self) -> &Path {
        &self.path
    }

    fn run_read_only<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>,
    {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags).map_err(|err| {
            AppError::new("DB_STORE/OPEN", "Failed to open read-only connection")
                .with_context("path", self.path.display().to_string())
                .with_cause(err)
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|err| AppError::from(err).with_context("operation", "busy_timeout"))?;
        f(&conn)
    }

    fn run_write_transaction<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> AppResult<T>,
    {
        use tracing::{error, info, warn};

        let mut guard = self.lock_writer()?;
        let conn = self.writer(&mut guard)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| AppError::from(err).with_context("operation", "begin_immediate"))?;
        info!(target: "storemend", event = "db_tx_begin");
        match f(&tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|err| AppError::from(err).with_context("operation", "commit"))?;
                info!(target: "storemend", event = "db_tx_commit");
                Ok(value)
            }
            Err(err) => {
                if let Err(rb) = tx.rollback() {
                    error!(target: "storemend", event = "db_tx_rollback_failed", error = %rb);
                } else {
                    warn!(target: "storemend", event = "db_tx_rollback", error = %err);
                }
                Err(err)
            }
        }
    }

    fn run_exclusive<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>,
    {
        let mut guard = self.lock_writer()?;
        let conn = self.writer(&mut guard)?;
        f(conn)
    }

    fn close_all_connections(&self) -> AppResult<()> {
        let mut guard = self.lock_writer()?;
        let Some(conn) = guard.take() else {
            return Ok(());
        };

        // Fold committed WAL frames into the primary file before it is copied.
        if let Err(err) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |row| {
            row.get::<_, i64>(0)
        }) {
            tracing::warn!(
                target: "storemend",
                event = "db_checkpoint_failed",
                error = %err,
                path = %self.path.display()
            );
        }

        conn.close().map_err(|(_, err)| {
            AppError::new("DB_STORE/CLOSE_FAILED", "Failed to close writer connection")
                .with_context("path", self.path.display().to_string())
                .with_cause(err)
        })?;
        tracing::info!(
            target: "storemend",
            event = "db_connections_closed",
            path = %self.path.display()
        );
        Ok(())
    }
}

fn open_writer(path: &Path) -> AppResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|err| {
        AppError::new("DB_STORE/OPEN", "Failed to open writer connection")
            .with_context("path", path.display().to_string())
            .with_cause(err)
    })?;

    let journal_mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(|err| {
            AppError::new("DB_STORE/OPEN", "Failed to enable WAL journal")
                .with_context("path", path.display().to_string())
                .with_cause(err)
        })?;
    conn.pragma_update(None, "foreign_keys", 1)
        .map_err(|err| AppError::from(err).with_context("operation", "foreign_keys"))?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)
        .map_err(|err| AppError::from(err).with_context("operation", "wal_autocheckpoint"))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|err| AppError::from(err).with_context("operation", "busy_timeout"))?;

    tracing::info!(
        target: "storemend",
        event = "db_open",
        path = %path.display(),
        journal_mode = %journal_mode,
        busy_timeout_ms = BUSY_TIMEOUT.as_millis() as u64
    );
    if !journal_mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(
            target: "storemend",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }

    Ok(conn)
}

/// `<db>` with `suffix` appended to the file name, e.g. `-wal`.
pub fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(db_path.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

pub fn wal_path(db_path: &Path) -> PathBuf {
    sidecar_path(db_path, "-wal")
}

pub fn shm_path(db_path: &Path) -> PathBuf {
    sidecar_path(db_path, "-shm")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sidecars_append_to_file_name() {
        let base = Path::new("/data/appdata.db");
        assert_eq!(wal_path(base), PathBuf::from("/data/appdata.db-wal"));
        assert_eq!(shm_path(base), PathBuf::from("/data/appdata.db-shm"));
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("store.db"));
        store
            .run_write_transaction(|tx| {
                tx.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);")?;
                Ok(())
            })
            .expect("create table");

        let result: AppResult<()> = store.run_write_transaction(|tx| {
            tx.execute("INSERT INTO t (id) VALUES (1)", [])?;
            Err(AppError::new("TEST/ABORT", "abort"))
        });
        assert!(result.is_err());

        let count: i64 = store
            .run_read_only(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .expect("count rows");
        assert_eq!(count, 0);
    }

    #[test]
    fn close_checkpoints_and_writer_reopens_lazily() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.db");
        let store = SqliteStore::new(&path);
        store
            .run_write_transaction(|tx| {
                tx.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (7);")?;
                Ok(())
            })
            .expect("seed");

        store.close_all_connections().expect("close");
        let wal_len = std::fs::metadata(wal_path(&path)).map(|m| m.len()).unwrap_or(0);
        assert_eq!(wal_len, 0);

        store
            .run_write_transaction(|tx| {
                tx.execute("INSERT INTO t VALUES (8)", [])?;
                Ok(())
            })
            .expect("reopen writer");
        store.close_all_connections().expect("close again");
        store.close_all_connections().expect("close is idempotent");
    }

    #[test]
    fn read_only_connection_rejects_writes() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("store.db"));
        store
            .run_exclusive(|conn| Ok(conn.execute_batch("CREATE TABLE t (id INTEGER);")?))
            .expect("create");
        let err = store
            .run_read_only(|conn| Ok(conn.execute("INSERT INTO t VALUES (1)", [])?))
            .expect_err("read-only write");
        assert!(err.code().starts_with("Sqlite/"));
    }
}
