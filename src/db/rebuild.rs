use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::config::EngineConfig;
use crate::{AppError, AppResult};

use super::backup::create_backup;
use super::schema::{quote_ident, staging_table, CANONICAL_SCHEMA, KNOWN_TABLES, SCHEMA_VERSION};
use super::StoreAccess;

/// Orphan pruning repeats while deletions keep exposing new violations.
const MAX_ORPHAN_PASSES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Done {
        #[ts(type = "number")]
        rows: u64,
    },
    Skipped,
    Failed {
        error: String,
    },
}

impl StepOutcome {
    pub fn rows(&self) -> Option<u64> {
        match self {
            StepOutcome::Done { rows } => Some(*rows),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct TableRecovery {
    pub table: String,
    pub staging: StepOutcome,
    pub restore: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ReconstructionReport {
    pub tables: Vec<TableRecovery>,
    pub dropped_objects: Vec<String>,
    #[ts(type = "number")]
    pub orphans_removed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub backup_path: Option<String>,
    pub schema_version: u32,
}

impl ReconstructionReport {
    pub fn table(&self, name: &str) -> Option<&TableRecovery> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// Tables whose rows could not be carried over.
    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| t.staging.is_failed() || t.restore.is_failed())
            .map(|t| t.table.as_str())
            .collect()
    }

    pub fn summary(&self) -> String {
        let restored: u64 = self.tables.iter().filter_map(|t| t.restore.rows()).sum();
        let failed = self.failed_tables();
        let mut out = format!(
            "schema v{} rebuilt, {} row(s) restored, {} orphan(s) removed",
            self.schema_version, restored, self.orphans_removed
        );
        if !failed.is_empty() {
            out.push_str(&format!(", not carried over: {}", failed.join(", ")));
        }
        out
    }
}

/// Rebuilds the canonical schema in one transaction, carrying over rows of
/// known tables when `preserve_data` is set.
///
/// A defensive backup is taken first; without it nothing is touched. Any
/// error outside the per-table copy steps rolls the whole rebuild back.
pub fn reconstruct<S: StoreAccess>(
    store: &S,
    config: &EngineConfig,
    preserve_data: bool,
) -> AppResult<ReconstructionReport> {
    let backup = create_backup(store, config).map_err(|err| {
        AppError::new(
            "DB_RECONSTRUCT/BACKUP_FAILED",
            "Defensive backup failed; reconstruction aborted",
        )
        .with_cause(err)
    })?;

    let mut report = store
        .run_exclusive(|conn| {
            // Enforcement cannot change inside a transaction, and the implicit
            // cascade deletes of DROP TABLE would walk damaged indexes.
            conn.pragma_update(None, "foreign_keys", 0)?;
            let outcome = rebuild_atomically(conn, preserve_data);
            if let Err(err) = conn.pragma_update(None, "foreign_keys", 1) {
                tracing::warn!(
                    target: "storemend",
                    event = "db_reconstruct_fk_restore_failed",
                    error = %err
                );
            }
            outcome
        })
        .map_err(|err| {
            if err.code().starts_with("DB_RECONSTRUCT/") {
                err
            } else {
                AppError::new(
                    "DB_RECONSTRUCT/ROLLED_BACK",
                    "Structural reconstruction rolled back",
                )
                .with_cause(err)
            }
        })?;

    report.backup_path = Some(backup.path);
    tracing::info!(
        target: "storemend",
        event = "db_reconstructed",
        summary = %report.summary(),
        backup = report.backup_path.as_deref().unwrap_or("")
    );
    Ok(report)
}

fn rebuild_atomically(conn: &Connection, preserve_data: bool) -> AppResult<ReconstructionReport> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|err| AppError::from(err).with_context("operation", "begin_immediate"))?;
    tracing::info!(target: "storemend", event = "db_tx_begin", operation = "reconstruct");
    match rebuild_in_tx(&tx, preserve_data) {
        Ok(report) => {
            tx.commit()
                .map_err(|err| AppError::from(err).with_context("operation", "commit"))?;
            tracing::info!(target: "storemend", event = "db_tx_commit", operation = "reconstruct");
            Ok(report)
        }
        Err(err) => {
            if let Err(rb) = tx.rollback() {
                tracing::error!(target: "storemend", event = "db_tx_rollback_failed", error = %rb);
            } else {
                tracing::warn!(
                    target: "storemend",
                    event = "db_tx_rollback",
                    operation = "reconstruct",
                    error = %err
                );
            }
            Err(err)
        }
    }
}

fn rebuild_in_tx(tx: &Transaction<'_>, preserve_data: bool) -> AppResult<ReconstructionReport> {
    let mut tables: Vec<TableRecovery> = KNOWN_TABLES
        .iter()
        .map(|table| TableRecovery {
            table: (*table).to_string(),
            staging: StepOutcome::Skipped,
            restore: StepOutcome::Skipped,
        })
        .collect();

    if preserve_data {
        for entry in &mut tables {
            entry.staging = stage_table(tx, &entry.table);
        }
    }

    let dropped_objects = drop_user_objects(tx)?;

    tx.execute_batch(CANONICAL_SCHEMA).map_err(|err| {
        AppError::new("DB_RECONSTRUCT/SCHEMA", "Failed to apply canonical schema").with_cause(err)
    })?;

    for entry in &mut tables {
        if entry.staging.rows().is_some() {
            entry.restore = restore_table(tx, &entry.table);
        }
    }

    let orphans_removed = prune_orphans(tx)?;

    for entry in &tables {
        if entry.staging.rows().is_some() {
            tx.execute_batch(&format!(
                "DROP TABLE IF EXISTS temp.{}",
                quote_ident(&staging_table(&entry.table))
            ))
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "drop_staging")
                    .with_context("table", entry.table.clone())
            })?;
        }
    }

    Ok(ReconstructionReport {
        tables,
        dropped_objects,
        orphans_removed,
        backup_path: None,
        schema_version: SCHEMA_VERSION,
    })
}

/// Runs `f` inside a savepoint; failures roll back only that savepoint.
fn in_savepoint<T>(
    tx: &Transaction<'_>,
    name: &str,
    f: impl FnOnce() -> rusqlite::Result<T>,
) -> Result<T, String> {
    let sp = quote_ident(name);
    tx.execute_batch(&format!("SAVEPOINT {sp}"))
        .map_err(|err| err.to_string())?;
    match f() {
        Ok(value) => {
            tx.execute_batch(&format!("RELEASE {sp}"))
                .map_err(|err| err.to_string())?;
            Ok(value)
        }
        Err(err) => {
            let _ = tx.execute_batch(&format!("ROLLBACK TO {sp}; RELEASE {sp}"));
            Err(err.to_string())
        }
    }
}

fn table_exists(tx: &Transaction<'_>, table: &str) -> rusqlite::Result<bool> {
    tx.query_row(
        "SELECT 1 FROM main.sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn stage_table(tx: &Transaction<'_>, table: &str) -> StepOutcome {
    match table_exists(tx, table) {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(
                target: "storemend",
                event = "db_reconstruct_stage_skipped",
                table,
                reason = "missing"
            );
            return StepOutcome::Skipped;
        }
        Err(err) => {
            return StepOutcome::Failed {
                error: err.to_string(),
            }
        }
    }

    let staging = quote_ident(&staging_table(table));
    let result = in_savepoint(tx, &format!("stage_{table}"), || {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS temp.{staging}"))?;
        tx.execute_batch(&format!(
            "CREATE TEMP TABLE {staging} AS SELECT * FROM main.{}",
            quote_ident(table)
        ))?;
        tx.query_row(&format!("SELECT COUNT(*) FROM temp.{staging}"), [], |row| {
            row.get::<_, i64>(0)
        })
    });

    match result {
        Ok(rows) => StepOutcome::Done {
            rows: rows.max(0) as u64,
        },
        Err(error) => {
            tracing::warn!(
                target: "storemend",
                event = "db_reconstruct_stage_failed",
                table,
                error = %error
            );
            StepOutcome::Failed { error }
        }
    }
}

fn drop_user_objects(tx: &Transaction<'_>) -> AppResult<Vec<String>> {
    let objects: Vec<(String, String)> = {
        let mut stmt = tx
            .prepare(
                "SELECT type, name FROM main.sqlite_master
                 WHERE type IN ('view', 'table')
                   AND name NOT LIKE 'sqlite_%'
                   AND substr(name, 1, 8) <> 'staging_'
                 ORDER BY CASE type WHEN 'view' THEN 0 ELSE 1 END, name",
            )
            .map_err(|err| AppError::from(err).with_context("operation", "list_objects"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|err| AppError::from(err).with_context("operation", "list_objects_query"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|err| AppError::from(err).with_context("operation", "collect_objects"))?
    };

    let mut dropped = Vec::with_capacity(objects.len());
    for (kind, name) in objects {
        let keyword = if kind == "view" { "VIEW" } else { "TABLE" };
        tx.execute_batch(&format!("DROP {keyword} IF EXISTS main.{}", quote_ident(&name)))
            .map_err(|err| {
                AppError::new("DB_RECONSTRUCT/DROP", "Failed to drop existing object")
                    .with_context("object", name.clone())
                    .with_cause(err)
            })?;
        dropped.push(format!("{kind} {name}"));
    }
    Ok(dropped)
}

/// Column names usable for copying, skipping hidden and generated columns.
fn table_columns(tx: &Transaction<'_>, schema: &str, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = tx.prepare(&format!(
        "PRAGMA {schema}.table_xinfo({})",
        quote_ident(table)
    ))?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get("name")?;
        let hidden: i64 = row.get("hidden")?;
        Ok((name, hidden))
    })?;
    let mut cols = Vec::new();
    for row in rows {
        let (name, hidden) = row?;
        if hidden == 0 {
            cols.push(name);
        }
    }
    Ok(cols)
}

fn restore_table(tx: &Transaction<'_>, table: &str) -> StepOutcome {
    let staging = staging_table(table);
    let result = in_savepoint(tx, &format!("restore_{table}"), || {
        let staged = table_columns(tx, "temp", &staging)?;
        let shared: Vec<String> = table_columns(tx, "main", table)?
            .into_iter()
            .filter(|col| staged.iter().any(|s| s.eq_ignore_ascii_case(col)))
            .collect();
        if shared.is_empty() {
            return Ok(None);
        }
        let cols = shared
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let copied = tx.execute(
            &format!(
                "INSERT INTO main.{} ({cols}) SELECT {cols} FROM temp.{}",
                quote_ident(table),
                quote_ident(&staging)
            ),
            [],
        )?;
        Ok(Some(copied as u64))
    });

    match result {
        Ok(Some(rows)) => StepOutcome::Done { rows },
        Ok(None) => StepOutcome::Failed {
            error: "no columns shared with the canonical table".to_string(),
        },
        Err(error) => {
            tracing::warn!(
                target: "storemend",
                event = "db_reconstruct_restore_failed",
                table,
                error = %error
            );
            StepOutcome::Failed { error }
        }
    }
}

fn prune_orphans(tx: &Transaction<'_>) -> AppResult<u64> {
    let mut removed = 0_u64;
    for _ in 0..MAX_ORPHAN_PASSES {
        let orphans: Vec<(String, i64)> = {
            let mut stmt = tx
                .prepare("PRAGMA main.foreign_key_check")
                .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)))
                .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check"))?;
            rows.filter_map(|row| match row {
                Ok((table, Some(rowid))) => Some(Ok((table, rowid))),
                Ok((_, None)) => None,
                Err(err) => Some(Err(err)),
            })
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_rows"))?
        };
        if orphans.is_empty() {
            break;
        }
        for (table, rowid) in orphans {
            removed += tx
                .execute(
                    &format!("DELETE FROM main.{} WHERE rowid = ?1", quote_ident(&table)),
                    [rowid],
                )
                .map_err(|err| {
                    AppError::new("DB_RECONSTRUCT/ORPHANS", "Failed to remove orphan row")
                        .with_context("table", table.clone())
                        .with_cause(err)
                })? as u64;
        }
    }
    if removed > 0 {
        tracing::warn!(target: "storemend", event = "db_reconstruct_orphans_removed", count = removed);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tx(conn: &mut Connection) -> Transaction<'_> {
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .expect("begin")
    }

    #[test]
    fn savepoint_failure_keeps_outer_transaction_usable() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);")
            .expect("create");
        let tx = open_tx(&mut conn);

        let failed = in_savepoint(&tx, "sp_fail", || {
            tx.execute("INSERT INTO t (id) VALUES (1)", [])?;
            tx.execute("INSERT INTO missing (id) VALUES (1)", [])
        });
        assert!(failed.unwrap_err().contains("missing"));

        in_savepoint(&tx, "sp_ok", || tx.execute("INSERT INTO t (id) VALUES (2)", []))
            .expect("second savepoint");
        tx.commit().expect("commit");

        let ids: Vec<i64> = conn
            .prepare("SELECT id FROM t")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn restore_copies_only_shared_columns() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE key_value_store (key TEXT PRIMARY KEY, value TEXT NOT NULL, legacy TEXT);
             INSERT INTO key_value_store VALUES ('theme', 'dark', 'x'), ('lang', 'en', 'y');",
        )
        .expect("seed legacy table");
        let tx = open_tx(&mut conn);

        let staged = stage_table(&tx, "key_value_store");
        assert_eq!(staged, StepOutcome::Done { rows: 2 });
        drop_user_objects(&tx).expect("drop");
        tx.execute_batch(CANONICAL_SCHEMA).expect("schema");
        let restored = restore_table(&tx, "key_value_store");
        assert_eq!(restored, StepOutcome::Done { rows: 2 });
        tx.commit().expect("commit");

        let value: String = conn
            .query_row(
                "SELECT value FROM key_value_store WHERE key = 'theme'",
                [],
                |r| r.get(0),
            )
            .expect("restored row");
        assert_eq!(value, "dark");
    }

    #[test]
    fn missing_table_is_skipped_not_failed() {
        let mut conn = Connection::open_in_memory().expect("open");
        let tx = open_tx(&mut conn);
        assert_eq!(stage_table(&tx, "sessions"), StepOutcome::Skipped);
    }

    #[test]
    fn rebuild_prunes_orphaned_jobs() {
        let conn = Connection::open_in_memory().expect("open");
        // Matches what `reconstruct` does before rebuilding.
        conn.pragma_update(None, "foreign_keys", 0).expect("fk off");
        conn.execute_batch(CANONICAL_SCHEMA).expect("schema");
        conn.execute_batch(
            "INSERT INTO sessions (id, name, project_directory, project_hash) VALUES ('s1', 'a', '/p', 'h');
             INSERT INTO background_jobs (id, session_id) VALUES ('j1', 's1'), ('j2', 'gone');",
        )
        .expect("seed with orphan");

        let report = rebuild_atomically(&conn, true).expect("rebuild");
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(
            report.table("background_jobs").map(|t| t.restore.clone()),
            Some(StepOutcome::Done { rows: 2 })
        );
        let jobs: i64 = conn
            .query_row("SELECT COUNT(*) FROM background_jobs", [], |r| r.get(0))
            .expect("count");
        assert_eq!(jobs, 1);
        let staging_left: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM temp.sqlite_master WHERE name LIKE 'staging%'",
                [],
                |r| r.get(0),
            )
            .expect("temp master");
        assert_eq!(staging_left, 0);
    }

    #[test]
    fn rebuild_without_preservation_leaves_empty_tables() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(CANONICAL_SCHEMA).expect("schema");
        conn.execute_batch("INSERT INTO key_value_store (key, value) VALUES ('a', 'b');")
            .expect("seed");

        let report = rebuild_atomically(&conn, false).expect("rebuild");
        assert!(report.tables.iter().all(|t| t.staging == StepOutcome::Skipped));
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM key_value_store", [], |r| r.get(0))
            .expect("count");
        assert_eq!(rows, 0);
    }

    #[test]
    fn summary_names_failed_tables() {
        let report = ReconstructionReport {
            tables: vec![TableRecovery {
                table: "sessions".into(),
                staging: StepOutcome::Failed {
                    error: "boom".into(),
                },
                restore: StepOutcome::Skipped,
            }],
            schema_version: SCHEMA_VERSION,
            ..Default::default()
        };
        assert!(report.summary().ends_with("not carried over: sessions"));
    }
}
