use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ts_rs::TS;

use crate::{AppError, AppResult};

use super::schema::SCHEMA_VERSION;

pub const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Sidecar written next to every backup copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub engine_version: String,
    pub source_path: String,
    #[ts(type = "number")]
    pub size_bytes: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub schema_hash: Option<String>,
    pub schema_version: u32,
    pub created_at: String,
}

impl BackupManifest {
    pub fn new(
        source_path: &Path,
        size_bytes: u64,
        sha256: impl Into<String>,
        schema_hash: Option<String>,
    ) -> Self {
        Self {
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            source_path: source_path.display().to_string(),
            size_bytes,
            sha256: sha256.into(),
            schema_hash,
            schema_version: SCHEMA_VERSION,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// `<backup>.manifest.json` for a backup file.
pub fn manifest_path_for(backup: &Path) -> PathBuf {
    let mut os = backup.as_os_str().to_os_string();
    os.push(MANIFEST_SUFFIX);
    PathBuf::from(os)
}

/// SHA-256 over the ordered `sqlite_master` entries.
pub fn schema_hash(conn: &Connection) -> rusqlite::Result<String> {
    let mut stmt = conn.prepare(
        "SELECT type, name, tbl_name, sql FROM sqlite_master
         WHERE type IN ('table','index','trigger','view')
         ORDER BY type, name",
    )?;
    let mut rows = stmt.query([])?;

    let mut hasher = Sha256::new();
    while let Some(row) = rows.next()? {
        let ty: String = row.get(0)?;
        let name: String = row.get(1)?;
        let tbl: String = row.get(2)?;
        let sql: Option<String> = row.get(3)?;

        hasher.update(ty.as_bytes());
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(tbl.as_bytes());
        hasher.update([0]);
        if let Some(sql) = sql {
            hasher.update(sql.as_bytes());
        }
        hasher.update([0]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn file_sha256(path: &Path) -> AppResult<String> {
    let mut file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_for_hash")
            .with_context("path", path.display().to_string())
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file
            .read(&mut buf)
            .map_err(|err| AppError::from(err).with_context("operation", "read_for_hash"))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn read_manifest(path: &Path) -> AppResult<BackupManifest> {
    let bytes = std::fs::read(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_manifest")
            .with_context("path", path.display().to_string())
    })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "parse_manifest")
            .with_context("path", path.display().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn schema_hash_is_stable_and_tracks_changes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE example(id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();

        let first = schema_hash(&conn).unwrap();
        let second = schema_hash(&conn).unwrap();
        assert_eq!(first, second);

        conn.execute_batch("CREATE INDEX idx_example_name ON example(name);")
            .unwrap();
        assert_ne!(first, schema_hash(&conn).unwrap());
    }

    #[test]
    fn file_sha256_matches_manual_digest() {
        let mut tmp = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, b"hello world").unwrap();
        let expected = format!("{:x}", Sha256::digest(b"hello world"));
        let actual = file_sha256(tmp.path()).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn manifest_path_appends_suffix() {
        let path = manifest_path_for(Path::new("/b/appdata-2024.db"));
        assert_eq!(path, PathBuf::from("/b/appdata-2024.db.manifest.json"));
    }

    #[test]
    fn read_manifest_parses_written_file() {
        let manifest = BackupManifest::new(Path::new("/data/app.db"), 42, "def", None);
        let tmp = NamedTempFile::new().unwrap();
        serde_json::to_writer_pretty(tmp.as_file(), &manifest).unwrap();
        tmp.as_file().sync_all().unwrap();
        let loaded = read_manifest(tmp.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
    }
}
