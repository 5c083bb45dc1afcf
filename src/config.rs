use std::env;
use std::path::{Path, PathBuf};

use crate::{AppError, AppResult};

pub const BACKUP_DIR_ENV: &str = "STOREMEND_BACKUP_DIR";
pub const REPAIR_TOOL_ENV: &str = "STOREMEND_REPAIR_TOOL";
pub const FULL_CHECK_LIMIT_ENV: &str = "STOREMEND_FULL_CHECK_LIMIT";

const BACKUP_DIR_NAME: &str = "backups";
const DEFAULT_REPAIR_TOOL: &str = "sqlite3";
const DEFAULT_FULL_CHECK_MAX_ERRORS: u32 = 100;
const HARD_MAX_FULL_CHECK_ERRORS: u32 = 10_000;
const DEFAULT_FREE_SPACE_MULTIPLIER: f64 = 1.2;

/// Tunables shared by every engine component.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Where backups land. `None` means `<db parent>/backups`.
    pub backup_dir: Option<PathBuf>,
    /// External utility invoked by the repair stage.
    pub repair_tool: PathBuf,
    /// Error cap for `full` structural scans.
    pub full_check_max_errors: u32,
    /// Free space required before a backup, as a multiple of the source size.
    pub free_space_multiplier: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_dir: None,
            repair_tool: PathBuf::from(DEFAULT_REPAIR_TOOL),
            full_check_max_errors: DEFAULT_FULL_CHECK_MAX_ERRORS,
            free_space_multiplier: DEFAULT_FREE_SPACE_MULTIPLIER,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env::var_os(BACKUP_DIR_ENV).filter(|value| !value.is_empty()) {
            config.backup_dir = Some(PathBuf::from(dir));
        }

        if let Some(tool) = env::var_os(REPAIR_TOOL_ENV).filter(|value| !value.is_empty()) {
            config.repair_tool = PathBuf::from(tool);
        }

        config.full_check_max_errors = env::var(FULL_CHECK_LIMIT_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .map(|value| value.clamp(1, HARD_MAX_FULL_CHECK_ERRORS))
            .unwrap_or(DEFAULT_FULL_CHECK_MAX_ERRORS);

        config
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn with_repair_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.repair_tool = tool.into();
        self
    }

    /// Directory that receives backups of `db_path`.
    pub fn backup_root(&self, db_path: &Path) -> AppResult<PathBuf> {
        if let Some(dir) = &self.backup_dir {
            return Ok(dir.clone());
        }
        let parent = db_path.parent().ok_or_else(|| {
            AppError::new(
                "DB_BACKUP/NO_PARENT",
                "Database path does not have a parent directory",
            )
            .with_context("path", db_path.display().to_string())
        })?;
        Ok(parent.join(BACKUP_DIR_NAME))
    }
}
