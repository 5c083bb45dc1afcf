//! Integrity verification and staged recovery for WAL-mode SQLite stores.
//!
//! [`db::health::check_integrity`] classifies a store into a [`Severity`];
//! [`db::recovery::run_recovery`] escalates from compaction through external
//! repair and structural reconstruction to a full reset, each gated by
//! [`RecoveryOptions`] and preceded by a backup. [`RecoveryEngine`] wraps
//! both for async callers.

pub mod config;
pub mod db;
pub mod engine;
mod error;
pub mod logging;

pub use config::EngineConfig;
pub use db::backup::BackupRecord;
pub use db::health::{CheckLevel, IntegrityAlert, IntegrityAlertHandler, IntegrityResult, Severity};
pub use db::recovery::{
    RecoveryEvent, RecoveryEventHandler, RecoveryOptions, RecoveryOutcome, RecoveryStage,
    StageStatus,
};
pub use db::{SqliteStore, StoreAccess};
pub use engine::RecoveryEngine;
pub use error::{AppError, AppResult};

/// Git commit the binary was built from, or `unknown`.
pub const GIT_HASH: &str = env!("STOREMEND_GIT_HASH");
