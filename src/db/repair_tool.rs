use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

use crate::config::EngineConfig;
use crate::{AppError, AppResult};

use super::StoreAccess;

/// Script handed to the external utility: check, then compact.
pub const REPAIR_SCRIPT: &str = "PRAGMA integrity_check; VACUUM;";
const AFFIRMATIVE_MARKER: &str = "ok";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("store file {path} does not exist")]
    MissingStore { path: String },
    #[error("could not close store connections before running {program}")]
    Close {
        program: String,
        #[source]
        source: AppError,
    },
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    fn code(&self) -> &'static str {
        match self {
            ToolError::MissingStore { .. } => "DB_REPAIR_TOOL/MISSING_STORE",
            ToolError::Close { .. } => "DB_REPAIR_TOOL/CLOSE_FAILED",
            ToolError::Spawn { .. } => "DB_REPAIR_TOOL/SPAWN",
        }
    }
}

impl From<ToolError> for AppError {
    fn from(error: ToolError) -> Self {
        let app = AppError::new(error.code(), error.to_string());
        match error {
            ToolError::MissingStore { path } => app.with_context("path", path),
            ToolError::Close { program, source } => {
                app.with_context("program", program).with_cause(source)
            }
            ToolError::Spawn { program, source } => {
                app.with_context("program", program).with_cause(source)
            }
        }
    }
}

/// Captured result of one external repair run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub exit_code: Option<i32>,
    /// Whether stdout carried the integrity check's `ok`.
    pub affirmed: bool,
}

/// Closes every connection and runs the configured repair utility against
/// the store file. Connections reopen lazily on next use.
pub fn invoke_repair_tool<S: StoreAccess>(
    store: &S,
    config: &EngineConfig,
) -> AppResult<ToolOutput> {
    run_tool(store, &config.repair_tool).map_err(AppError::from)
}

fn run_tool<S: StoreAccess>(store: &S, tool: &Path) -> Result<ToolOutput, ToolError> {
    let program = tool.display().to_string();
    let db_path = store.db_path();
    // The CLI would silently create an empty store.
    if !db_path.is_file() {
        return Err(ToolError::MissingStore {
            path: db_path.display().to_string(),
        });
    }

    store
        .close_all_connections()
        .map_err(|source| ToolError::Close {
            program: program.clone(),
            source,
        })?;

    tracing::info!(
        target: "storemend",
        event = "db_repair_tool_start",
        program = %program,
        path = %db_path.display()
    );
    let output = Command::new(tool)
        .arg(db_path)
        .arg(REPAIR_SCRIPT)
        .output()
        .map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let affirmed = is_affirmed(&stdout);

    if !stderr.trim().is_empty() {
        tracing::warn!(
            target: "storemend",
            event = "db_repair_tool_stderr",
            program = %program,
            stderr = %stderr.trim()
        );
    }
    tracing::info!(
        target: "storemend",
        event = "db_repair_tool_finished",
        program = %program,
        exit_code = output.status.code().unwrap_or(-1),
        affirmed
    );

    Ok(ToolOutput {
        stdout,
        stderr,
        exit_code: output.status.code(),
        affirmed,
    })
}

fn is_affirmed(stdout: &str) -> bool {
    stdout
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case(AFFIRMATIVE_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affirmation_requires_a_whole_ok_line() {
        assert!(is_affirmed("ok\n"));
        assert!(is_affirmed("  OK  \r\n"));
        assert!(is_affirmed("*** warning\nok\n"));
        assert!(!is_affirmed("row 4 missing from index broken_idx\n"));
        assert!(!is_affirmed("token"));
        assert!(!is_affirmed(""));
    }

    #[test]
    fn spawn_error_maps_to_repair_tool_code() {
        let err = ToolError::Spawn {
            program: "sqlite3-missing".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let app: AppError = err.into();
        assert_eq!(app.code(), "DB_REPAIR_TOOL/SPAWN");
        assert_eq!(
            app.context().get("program").map(String::as_str),
            Some("sqlite3-missing")
        );
        assert_eq!(app.cause().map(|c| c.code()), Some("IO/NotFound"));
    }
}
