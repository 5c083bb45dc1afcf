#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::{Connection, Transaction};
use storemend_lib::db::schema::CANONICAL_SCHEMA;
use storemend_lib::db::wal_path;
use storemend_lib::{AppError, AppResult, EngineConfig, SqliteStore, StoreAccess};
use tempfile::TempDir;

pub const PAGE_SIZE: usize = 4096;

pub struct TempStore {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TempStore {
    pub fn new(name: &str) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(name);
        Self { dir, path }
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        Arc::new(SqliteStore::new(&self.path))
    }

    /// Backups land inside the temp dir; the repair tool never resolves so
    /// runs do not depend on a system `sqlite3`.
    pub fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_backup_dir(self.backups_dir())
            .with_repair_tool(self.dir.path().join("no-such-sqlite3"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    pub fn backup_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(self.backups_dir()) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .map(|entry| entry.unwrap().path())
            .filter(|path| !path.to_string_lossy().ends_with(".manifest.json"))
            .collect();
        files.sort();
        files
    }
}

fn open_seed_connection(path: &Path) -> Connection {
    let conn = Connection::open(path).expect("open seed connection");
    conn.pragma_update(None, "page_size", PAGE_SIZE as i64)
        .expect("page size");
    let _: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .expect("wal");
    conn
}

/// Canonical schema with `sessions` rows and one job per session.
pub fn seed_canonical(path: &Path, sessions: usize) {
    let conn = open_seed_connection(path);
    conn.execute_batch(CANONICAL_SCHEMA).expect("schema");
    for i in 0..sessions {
        conn.execute(
            "INSERT INTO sessions (id, name, project_directory, project_hash) VALUES (?1, ?2, ?3, ?4)",
            (
                format!("s-{i}"),
                format!("session {i}"),
                format!("/work/project-{}", i % 3),
                format!("hash-{:04}", i),
            ),
        )
        .expect("insert session");
        conn.execute(
            "INSERT INTO background_jobs (id, session_id, status) VALUES (?1, ?2, 'completed')",
            (format!("j-{i}"), format!("s-{i}")),
        )
        .expect("insert job");
    }
    conn.execute(
        "INSERT INTO key_value_store (key, value) VALUES ('theme', 'dark')",
        [],
    )
    .expect("insert kv");
    conn.execute(
        "INSERT INTO schema_migrations (version) VALUES ('0004')",
        [],
    )
    .expect("insert migration");
    conn.close().expect("close seed connection");
}

/// Canonical store holding a job whose session does not exist.
pub fn seed_fk_violation(path: &Path) {
    seed_canonical(path, 2);
    let conn = Connection::open(path).expect("open");
    conn.pragma_update(None, "foreign_keys", 0).expect("fk off");
    conn.execute(
        "INSERT INTO background_jobs (id, session_id) VALUES ('orphan', 'missing-session')",
        [],
    )
    .expect("insert orphan job");
    conn.close().expect("close");
}

/// Canonical store with `pending` key/value rows that exist only in a
/// `-wal` sidecar, as left by a process that exited without checkpointing.
pub fn seed_with_leftover_wal(path: &Path, pending: usize) {
    let origin = path.with_file_name("origin.db");
    seed_canonical(&origin, 2);
    let conn = Connection::open(&origin).expect("open origin");
    conn.pragma_update(None, "wal_autocheckpoint", 0)
        .expect("disable autocheckpoint");
    for i in 0..pending {
        conn.execute(
            "INSERT INTO key_value_store (key, value) VALUES (?1, 'wal-only')",
            [format!("pending-{i}")],
        )
        .expect("insert pending kv");
    }
    // Copy while the writer is still open so the frames stay in the WAL.
    fs::copy(&origin, path).expect("copy primary");
    fs::copy(wal_path(&origin), wal_path(path)).expect("copy wal");
    drop(conn);
    assert!(fs::metadata(wal_path(path)).expect("wal").len() > 0);
}

/// Executable `/bin/sh` script standing in for the external repair utility.
/// It receives the store path as `$1` and the repair script as `$2`.
#[cfg(unix)]
pub fn fake_repair_tool(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-sqlite3");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write tool");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod tool");
    path
}

/// A valid SQLite file without a single table.
pub fn seed_empty(path: &Path) {
    let conn = open_seed_connection(path);
    conn.pragma_update(None, "user_version", 1).expect("user_version");
    conn.close().expect("close");
}

/// Bytes that SQLite refuses to treat as a database.
pub fn write_garbage(path: &Path) -> Vec<u8> {
    let bytes = b"definitely not a database file; ".repeat(64);
    fs::write(path, &bytes).expect("write garbage");
    bytes
}

/// Replaces the root page of `index` with an empty leaf so every row is
/// missing from it. The store must be closed.
pub fn corrupt_index(path: &Path, index: &str) {
    let root: i64 = {
        let conn = Connection::open(path).expect("open");
        let root = conn
            .query_row(
                "SELECT rootpage FROM sqlite_master WHERE type = 'index' AND name = ?1",
                [index],
                |row| row.get(0),
            )
            .expect("index root page");
        conn.close().expect("close");
        root
    };
    assert!(root > 1, "index root must not be the header page");

    let mut bytes = fs::read(path).expect("read store");
    let offset = (root as usize - 1) * PAGE_SIZE;
    let page = &mut bytes[offset..offset + PAGE_SIZE];
    page.fill(0);
    page[0] = 0x0a; // leaf index b-tree page
    page[5] = 0x10; // cell content starts at 4096
    page[6] = 0x00;
    fs::write(path, bytes).expect("write store");
}

pub fn count_rows(path: &Path, table: &str) -> i64 {
    let conn = Connection::open(path).expect("open");
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .expect("count rows")
}

/// Store whose `close_all_connections` can be made to fail, which breaks
/// every backup taken through it.
pub struct FlakyStore {
    inner: SqliteStore,
    fail_close: AtomicBool,
}

impl FlakyStore {
    pub fn new(path: &Path) -> Self {
        Self {
            inner: SqliteStore::new(path),
            fail_close: AtomicBool::new(false),
        }
    }

    pub fn failing(path: &Path) -> Self {
        let store = Self::new(path);
        store.fail_close.store(true, Ordering::SeqCst);
        store
    }
}

impl StoreAccess for FlakyStore {
    fn db_path(&self) -> &Path {
        self.inner.db_path()
    }

    fn run_read_only<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>,
    {
        self.inner.run_read_only(f)
    }

    fn run_write_transaction<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> AppResult<T>,
    {
        self.inner.run_write_transaction(f)
    }

    fn run_exclusive<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>,
    {
        self.inner.run_exclusive(f)
    }

    fn close_all_connections(&self) -> AppResult<()> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(AppError::new("TEST/CLOSE", "simulated close failure"));
        }
        self.inner.close_all_connections()
    }
}

pub struct BufferWriter(pub Arc<StdMutex<Vec<u8>>>);

impl std::io::Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn logs_to_string(buffer: &Arc<StdMutex<Vec<u8>>>) -> String {
    String::from_utf8(buffer.lock().unwrap().clone()).expect("log utf8")
}
