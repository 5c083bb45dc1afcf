use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ts_rs::TS;

use crate::config::EngineConfig;
use crate::AppError;

use super::manifest;
use super::schema::ESSENTIAL_TABLES;
use super::{wal_path, StoreAccess};

const WAL_MAGIC: u32 = 0x377f_0682;
const WAL_HEADER_LEN: u64 = 32;
const WAL_FRAME_HEADER_LEN: u64 = 24;

pub const NO_TABLES_ERROR: &str = "store has no tables";
pub const MISSING_FILE_CATEGORY: &str = "MISSING_FILE";

const REC_BACKUP_FIRST: &str = "Back up the store before attempting any repair";
const REC_COMPACT: &str = "Try compaction (VACUUM) to rebuild damaged pages";
const REC_RESTORE: &str = "Restore from the most recent backup if compaction does not help";
const REC_RESET: &str = "Reset the store from a backup; the file cannot be read as a database";
const REC_RECREATE: &str = "Recreate the store structure to restore missing tables and relations";
const REC_CHECK_FAILED: &str = "Consider recreating the store";

/// Lower-case fragments that mean the file cannot be read as a store at all.
const UNREADABLE_MARKERS: &[&str] = &[
    "file is not a database",
    "not a database",
    "disk image is malformed",
    "unable to open",
    "failed to open",
];

const MALFORMED_MARKERS: &[&str] = &["malformed", "corrupt"];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Healthy,
    Degraded,
    Critical,
    Fatal,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Healthy => "healthy",
            Severity::Degraded => "degraded",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum CheckLevel {
    Quick,
    #[default]
    Normal,
    Full,
}

impl CheckLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckLevel::Quick => "quick",
            CheckLevel::Normal => "normal",
            CheckLevel::Full => "full",
        }
    }

    fn structural_pragma(self, max_errors: u32) -> String {
        match self {
            CheckLevel::Quick => "PRAGMA quick_check;".to_string(),
            CheckLevel::Normal => "PRAGMA integrity_check;".to_string(),
            CheckLevel::Full => format!("PRAGMA integrity_check({max_errors});"),
        }
    }
}

impl FromStr for CheckLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(CheckLevel::Quick),
            "normal" => Ok(CheckLevel::Normal),
            "full" => Ok(CheckLevel::Full),
            other => Err(format!(
                "unknown check level '{other}' (expected quick, normal or full)"
            )),
        }
    }
}

impl fmt::Display for CheckLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single error line says about the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FindingKind {
    /// Foreign-key or completeness problem; the structure itself is sound.
    Constraint,
    /// Structural malformation; some tables may still be readable.
    Malformed,
    /// The file cannot be opened or read as a store.
    Unreadable,
}

impl FindingKind {
    pub fn severity(self) -> Severity {
        match self {
            FindingKind::Constraint => Severity::Degraded,
            FindingKind::Malformed => Severity::Critical,
            FindingKind::Unreadable => Severity::Fatal,
        }
    }
}

/// Which scan produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSource {
    Structural,
    ForeignKeys,
    Schema,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub kind: FindingKind,
    pub source: ScanSource,
    pub message: String,
}

impl Finding {
    /// Categorizes `message` by its text, then by the scan it came from.
    pub fn classify(source: ScanSource, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let kind = if UNREADABLE_MARKERS.iter().any(|m| lower.contains(m)) {
            FindingKind::Unreadable
        } else if source == ScanSource::Structural
            || MALFORMED_MARKERS.iter().any(|m| lower.contains(m))
        {
            FindingKind::Malformed
        } else {
            FindingKind::Constraint
        };
        Self {
            kind,
            source,
            message,
        }
    }
}

/// Non-empty problem lines from a diagnostic pragma's rows; a lone `ok`
/// yields none. Rows may themselves hold several newline-separated lines.
pub fn problem_lines(rows: &[String]) -> Vec<String> {
    let lines: Vec<String> = rows
        .iter()
        .flat_map(|chunk| chunk.lines())
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if lines.len() == 1 && lines[0].eq_ignore_ascii_case("ok") {
        Vec::new()
    } else {
        lines
    }
}

/// Lock contention says nothing about the file's health.
pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Highest severity implied by `findings`.
pub fn classify(findings: &[Finding]) -> Severity {
    findings
        .iter()
        .map(|finding| finding.kind.severity())
        .max()
        .unwrap_or(Severity::Healthy)
}

/// Ordered advice for the finding categories present.
pub fn recommendations_for(findings: &[Finding]) -> Vec<String> {
    let has = |kind: FindingKind| findings.iter().any(|f| f.kind == kind);
    let malformed = has(FindingKind::Malformed);
    let unreadable = has(FindingKind::Unreadable);

    let mut out = Vec::new();
    if !findings.is_empty() {
        out.push(REC_BACKUP_FIRST.to_string());
    }
    if malformed || unreadable {
        out.push(REC_COMPACT.to_string());
    }
    if malformed {
        out.push(REC_RESTORE.to_string());
    }
    if unreadable {
        out.push(REC_RESET.to_string());
    }
    if has(FindingKind::Constraint) {
        out.push(REC_RECREATE.to_string());
    }
    out
}

/// Snapshot of one diagnostic run.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct IntegrityResult {
    is_valid: bool,
    severity: Severity,
    errors: Vec<String>,
    recommendations: Vec<String>,
    details: Value,
    timestamp: DateTime<Utc>,
}

impl IntegrityResult {
    pub fn new(
        severity: Severity,
        errors: Vec<String>,
        recommendations: Vec<String>,
        details: Value,
    ) -> Self {
        Self {
            is_valid: severity == Severity::Healthy,
            severity,
            errors,
            recommendations,
            details,
            timestamp: Utc::now(),
        }
    }

    pub fn from_findings(findings: Vec<Finding>, details: Value) -> Self {
        let severity = classify(&findings);
        let recommendations = recommendations_for(&findings);
        let errors = findings.into_iter().map(|f| f.message).collect();
        Self::new(severity, errors, recommendations, details)
    }

    pub fn healthy(details: Value) -> Self {
        Self::new(Severity::Healthy, Vec::new(), Vec::new(), details)
    }

    /// Result used when the diagnostics could not run at all.
    pub fn check_failed(level: CheckLevel, err: &AppError) -> Self {
        Self::new(
            Severity::Critical,
            vec![format!("integrity check could not run: {}", err.chain_message())],
            vec![REC_CHECK_FAILED.to_string()],
            json!({ "level": level.as_str(), "failure": err }),
        )
    }

    fn insert_detail(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.details {
            map.insert(key.to_string(), value);
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn recommendations(&self) -> &[String] {
        &self.recommendations
    }

    pub fn details(&self) -> &Value {
        &self.details
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Notification raised for `Critical` and `Fatal` results.
#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityAlert {
    pub db_path: String,
    pub severity: Severity,
    pub errors: Vec<String>,
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

pub type IntegrityAlertHandler = Arc<dyn Fn(&IntegrityAlert) + Send + Sync + 'static>;

/// Runs the layered read-only diagnostics. Never fails; problems running the
/// scans become part of the result.
pub fn check_integrity<S: StoreAccess>(
    store: &S,
    config: &EngineConfig,
    level: CheckLevel,
    alerts: Option<&IntegrityAlertHandler>,
) -> IntegrityResult {
    let start = Instant::now();
    let db_path = store.db_path().to_path_buf();
    let file = file_facts(&db_path);
    let scanned = if file["category"] == MISSING_FILE_CATEGORY {
        Err(
            AppError::new("DB_STORE/MISSING_FILE", "Store file does not exist")
                .with_context("path", db_path.display().to_string()),
        )
    } else {
        store.run_read_only(|conn| {
            Ok(run_scans(conn, &db_path, level, config.full_check_max_errors)?)
        })
    };
    let mut result = match scanned {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(
                target: "storemend",
                event = "db_integrity_check_failed",
                level = level.as_str(),
                error = %err
            );
            IntegrityResult::check_failed(level, &err)
        }
    };
    result.insert_detail("file", file);

    tracing::info!(
        target: "storemend",
        event = "db_integrity_checked",
        level = level.as_str(),
        severity = result.severity().as_str(),
        errors = result.errors().len(),
        duration_ms = start.elapsed().as_millis() as u64
    );

    if result.severity() >= Severity::Critical {
        dispatch_alert(&db_path, &result, alerts);
    }

    result
}

/// Filesystem facts about the store file, reported under `details.file`.
pub fn file_facts(path: &Path) -> Value {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            let category = if err.kind() == std::io::ErrorKind::NotFound {
                MISSING_FILE_CATEGORY
            } else {
                "METADATA_UNAVAILABLE"
            };
            return json!({
                "exists": false,
                "category": category,
                "error": err.to_string(),
            });
        }
    };
    let modified = meta
        .modified()
        .ok()
        .map(|time| DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true));
    json!({
        "exists": true,
        "size_bytes": meta.len(),
        "permissions": permission_bits(&meta),
        "readonly": meta.permissions().readonly(),
        "modified": modified,
    })
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;
    Some(format!("0o{:o}", meta.permissions().mode() & 0o777))
}

#[cfg(not(unix))]
fn permission_bits(_meta: &fs::Metadata) -> Option<String> {
    None
}

fn dispatch_alert(db_path: &Path, result: &IntegrityResult, alerts: Option<&IntegrityAlertHandler>) {
    let alert = IntegrityAlert {
        db_path: db_path.display().to_string(),
        severity: result.severity(),
        errors: result.errors().to_vec(),
        recommendations: result.recommendations().to_vec(),
        timestamp: result.timestamp(),
    };
    tracing::error!(
        target: "storemend",
        event = "db_integrity_alert",
        path = %alert.db_path,
        severity = alert.severity.as_str(),
        first_error = alert.errors.first().map(String::as_str).unwrap_or("")
    );
    if let Some(handler) = alerts {
        handler(&alert);
    }
}

/// Runs every scan on `conn`. Busy or locked errors abort the run instead of
/// being reported as findings.
fn run_scans(
    conn: &Connection,
    db_path: &Path,
    level: CheckLevel,
    max_errors: u32,
) -> rusqlite::Result<IntegrityResult> {
    let mut findings = Vec::new();
    let mut details = serde_json::Map::new();
    details.insert("level".into(), json!(level.as_str()));

    let structural = structural_scan(conn, level, max_errors)?;
    let unreadable = structural
        .findings
        .iter()
        .any(|f| f.kind == FindingKind::Unreadable);
    details.insert("structural".into(), structural.details);
    findings.extend(structural.findings);

    if unreadable {
        // Every further query fails the same way.
        details.insert("skipped".into(), json!(["foreign_keys", "schema", "wal"]));
        return Ok(IntegrityResult::from_findings(findings, Value::Object(details)));
    }

    let fk = foreign_key_scan(conn)?;
    details.insert("foreign_keys".into(), fk.details);
    findings.extend(fk.findings);

    let schema = schema_scan(conn)?;
    details.insert("schema".into(), schema.details);
    findings.extend(schema.findings);

    let page_size = conn
        .query_row("PRAGMA page_size;", [], |row| row.get::<_, i64>(0))
        .unwrap_or(4096);
    let wal = inspect_wal_file(db_path, page_size);
    details.insert(
        "wal".into(),
        json!({ "passed": wal.passed, "state": wal.details }),
    );
    if let Ok(hash) = manifest::schema_hash(conn) {
        details.insert("schema_hash".into(), json!(hash));
    }

    Ok(IntegrityResult::from_findings(findings, Value::Object(details)))
}

struct ScanResult {
    findings: Vec<Finding>,
    details: Value,
}

fn structural_scan(
    conn: &Connection,
    level: CheckLevel,
    max_errors: u32,
) -> rusqlite::Result<ScanResult> {
    let start = Instant::now();
    let pragma = level.structural_pragma(max_errors);
    let (findings, output) = match query_text_rows(conn, &pragma) {
        Ok(rows) => {
            let lines = problem_lines(&rows);
            let findings = lines
                .iter()
                .map(|line| Finding::classify(ScanSource::Structural, line.clone()))
                .collect();
            (findings, lines)
        }
        Err(err) if is_transient(&err) => return Err(err),
        Err(err) => {
            let message = format!("structural scan failed: {err}");
            (
                vec![Finding::classify(ScanSource::Structural, message.clone())],
                vec![message],
            )
        }
    };
    Ok(ScanResult {
        findings,
        details: json!({
            "pragma": pragma.trim_end_matches(';'),
            "output": output,
            "duration_ms": start.elapsed().as_millis() as u64,
        }),
    })
}

fn query_text_rows(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn foreign_key_scan(conn: &Connection) -> rusqlite::Result<ScanResult> {
    let start = Instant::now();
    let mut violations = Vec::new();
    let findings = match foreign_key_rows(conn) {
        Ok(rows) => rows
            .into_iter()
            .map(|row| {
                let message = row.message();
                violations.push(json!({
                    "table": row.table,
                    "rowid": row.rowid,
                    "parent": row.parent,
                    "fkid": row.fkid,
                }));
                Finding::classify(ScanSource::ForeignKeys, message)
            })
            .collect(),
        Err(err) if is_transient(&err) => return Err(err),
        Err(err) => vec![Finding::classify(
            ScanSource::ForeignKeys,
            format!("foreign key scan failed: {err}"),
        )],
    };
    Ok(ScanResult {
        findings,
        details: json!({
            "violations": violations,
            "duration_ms": start.elapsed().as_millis() as u64,
        }),
    })
}

struct ForeignKeyViolation {
    table: String,
    rowid: Option<i64>,
    parent: String,
    fkid: i64,
}

impl ForeignKeyViolation {
    fn message(&self) -> String {
        let rowid = self
            .rowid
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string());
        format!(
            "Foreign key violation in {} row {}: missing parent in {} (constraint #{})",
            self.table, rowid, self.parent, self.fkid
        )
    }
}

fn foreign_key_rows(conn: &Connection) -> rusqlite::Result<Vec<ForeignKeyViolation>> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check;")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get(1)?,
            parent: row.get(2)?,
            fkid: row.get(3)?,
        })
    })?;
    rows.collect()
}

fn schema_scan(conn: &Connection) -> rusqlite::Result<ScanResult> {
    let start = Instant::now();
    let listed = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .and_then(|mut stmt| {
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()
        });

    let (findings, tables, missing) = match listed {
        Ok(tables) if tables.is_empty() => (
            vec![Finding::classify(ScanSource::Schema, NO_TABLES_ERROR)],
            tables,
            Vec::new(),
        ),
        Ok(tables) => {
            let missing: Vec<&str> = ESSENTIAL_TABLES
                .iter()
                .copied()
                .filter(|essential| !tables.iter().any(|t| t == essential))
                .collect();
            let findings = if missing.is_empty() {
                Vec::new()
            } else {
                vec![Finding::classify(
                    ScanSource::Schema,
                    format!("missing essential tables: {}", missing.join(", ")),
                )]
            };
            (findings, tables, missing)
        }
        Err(err) if is_transient(&err) => return Err(err),
        Err(err) => (
            vec![Finding::classify(
                ScanSource::Schema,
                format!("table listing failed: {err}"),
            )],
            Vec::new(),
            Vec::new(),
        ),
    };

    Ok(ScanResult {
        findings,
        details: json!({
            "tables": tables,
            "missing_essential": missing,
            "duration_ms": start.elapsed().as_millis() as u64,
        }),
    })
}

struct WalOutcome {
    passed: bool,
    details: String,
}

fn inspect_wal_file(db_path: &Path, page_size: i64) -> WalOutcome {
    let wal_path = wal_path(db_path);
    let meta = match std::fs::metadata(&wal_path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return WalOutcome {
                passed: true,
                details: "wal=absent".to_string(),
            }
        }
        Err(err) => {
            return WalOutcome {
                passed: false,
                details: format!("wal metadata error: {err}"),
            }
        }
        Ok(meta) => meta,
    };

    let len = meta.len();
    if len == 0 {
        return WalOutcome {
            passed: true,
            details: "wal=empty".to_string(),
        };
    }
    if len < WAL_HEADER_LEN {
        return WalOutcome {
            passed: false,
            details: format!("wal too small: {len} bytes"),
        };
    }

    let mut header = [0u8; WAL_HEADER_LEN as usize];
    if let Err(err) = File::open(&wal_path).and_then(|mut f| f.read_exact(&mut header)) {
        return WalOutcome {
            passed: false,
            details: format!("wal read error: {err}"),
        };
    }

    // The low bit of the magic number encodes checksum endianness.
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic & !1 != WAL_MAGIC {
        return WalOutcome {
            passed: false,
            details: "wal magic header mismatch".to_string(),
        };
    }

    let header_page_size = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let wal_page_size = match header_page_size {
        0 | 1 => page_size.max(0) as u64,
        value => u64::from(value),
    };
    if wal_page_size != page_size.max(0) as u64 {
        return WalOutcome {
            passed: false,
            details: format!(
                "wal page size mismatch: expected {page_size}, header {wal_page_size}"
            ),
        };
    }

    let frame_size = wal_page_size + WAL_FRAME_HEADER_LEN;
    let payload = len - WAL_HEADER_LEN;
    if payload % frame_size != 0 {
        return WalOutcome {
            passed: false,
            details: format!("wal size misaligned: len={len}, frame_size={frame_size}"),
        };
    }
    WalOutcome {
        passed: true,
        details: format!("wal frames={}", payload / frame_size),
    }
}
