use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use ts_rs::TS;

use crate::config::EngineConfig;
use crate::AppResult;

use super::backup::create_backup;
use super::health::{check_integrity, CheckLevel, IntegrityAlertHandler, IntegrityResult, Severity};
use super::rebuild::reconstruct;
use super::repair_tool::invoke_repair_tool;
use super::reset::reset_store;
use super::StoreAccess;

/// Owner read/write only.
pub const STORE_FILE_MODE: u32 = 0o600;

pub const SAFETY_GATE_ACTION: &str =
    "safety-gate: destructive stages blocked because the backup failed";

/// Permissions controlling how invasive a recovery run may be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryOptions {
    pub create_backup: bool,
    pub attempt_vacuum: bool,
    pub attempt_external_repair: bool,
    pub allow_recreate_structure: bool,
    pub allow_reset_database: bool,
    /// Carry rows of known tables across a structural rebuild.
    pub attempt_data_recovery: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            attempt_vacuum: true,
            attempt_external_repair: true,
            allow_recreate_structure: false,
            allow_reset_database: false,
            attempt_data_recovery: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStage {
    Backup,
    InitialCheck,
    Vacuum,
    ExternalRepair,
    RecreateStructure,
    Reset,
    FinalCheck,
}

impl RecoveryStage {
    pub fn label(self) -> &'static str {
        match self {
            RecoveryStage::Backup => "backup",
            RecoveryStage::InitialCheck => "initial-check",
            RecoveryStage::Vacuum => "vacuum",
            RecoveryStage::ExternalRepair => "external-repair",
            RecoveryStage::RecreateStructure => "recreate-structure",
            RecoveryStage::Reset => "reset",
            RecoveryStage::FinalCheck => "final-check",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Success,
    Warning,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: RecoveryStage,
    pub status: StageStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryEvent {
    Stage {
        stage: RecoveryStage,
        status: StageStatus,
        message: String,
    },
}

pub type RecoveryEventHandler = Arc<dyn Fn(RecoveryEvent) + Send + Sync + 'static>;

#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub actions: Vec<String>,
    pub original_integrity: IntegrityResult,
    pub final_integrity: IntegrityResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub backup_path: Option<String>,
    pub stages: Vec<StageReport>,
    #[ts(type = "number")]
    pub duration_ms: u64,
}

/// Collaborators and hooks for one recovery run.
pub struct RecoveryContext<'a, S: StoreAccess> {
    pub store: &'a S,
    pub config: &'a EngineConfig,
    pub alerts: Option<&'a IntegrityAlertHandler>,
    pub observer: Option<&'a RecoveryEventHandler>,
}

impl<S: StoreAccess> RecoveryContext<'_, S> {
    fn check(&self) -> IntegrityResult {
        check_integrity(self.store, self.config, CheckLevel::Normal, self.alerts)
    }
}

struct Trail<'a> {
    actions: Vec<String>,
    stages: Vec<StageReport>,
    observer: Option<&'a RecoveryEventHandler>,
}

impl<'a> Trail<'a> {
    fn new(observer: Option<&'a RecoveryEventHandler>) -> Self {
        Self {
            actions: Vec::new(),
            stages: Vec::new(),
            observer,
        }
    }

    fn emit(&mut self, stage: RecoveryStage, status: StageStatus, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(
            target: "storemend",
            event = "db_recovery_stage",
            stage = stage.label(),
            status = ?status,
            message = %message
        );
        // Skipped stages never ran; they stay out of the audit trail.
        if status != StageStatus::Skipped {
            self.actions.push(format!("{}: {}", stage.label(), message));
        }
        if status != StageStatus::Running {
            self.stages.push(StageReport {
                stage,
                status,
                message: message.clone(),
            });
        }
        if let Some(callback) = self.observer {
            callback(RecoveryEvent::Stage {
                stage,
                status,
                message,
            });
        }
    }

    fn block(&mut self, stage: RecoveryStage) {
        if !self.actions.iter().any(|a| a == SAFETY_GATE_ACTION) {
            tracing::warn!(target: "storemend", event = "db_recovery_safety_gate", stage = stage.label());
            self.actions.push(SAFETY_GATE_ACTION.to_string());
        }
        self.emit(stage, StageStatus::Skipped, "blocked by safety gate");
    }

    fn finish(
        self,
        success: bool,
        original: IntegrityResult,
        final_integrity: IntegrityResult,
        backup_path: Option<String>,
        start: Instant,
    ) -> RecoveryOutcome {
        let outcome = RecoveryOutcome {
            success,
            actions: self.actions,
            original_integrity: original,
            final_integrity,
            backup_path,
            stages: self.stages,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        tracing::info!(
            target: "storemend",
            event = "db_recovery_finished",
            success,
            original = outcome.original_integrity.severity().as_str(),
            final_severity = outcome.final_integrity.severity().as_str(),
            duration_ms = outcome.duration_ms
        );
        outcome
    }
}

fn severity_note(result: &IntegrityResult) -> String {
    format!(
        "severity {} with {} error(s)",
        result.severity(),
        result.errors().len()
    )
}

/// Staged recovery: backup, check, then escalate through increasingly
/// invasive repairs only while the options allow and the store is still
/// unhealthy.
pub fn run_recovery<S: StoreAccess>(
    ctx: &RecoveryContext<'_, S>,
    options: &RecoveryOptions,
) -> RecoveryOutcome {
    use RecoveryStage as Stage;
    use StageStatus as Status;

    let start = Instant::now();
    let mut trail = Trail::new(ctx.observer);
    tracing::info!(target: "storemend", event = "db_recovery_start", options = ?options);

    let mut backup_path = None;
    let mut backup_failed = false;
    if options.create_backup {
        trail.emit(Stage::Backup, Status::Running, "creating backup");
        match create_backup(ctx.store, ctx.config) {
            Ok(record) => {
                trail.emit(
                    Stage::Backup,
                    Status::Success,
                    format!("stored at {}", record.path),
                );
                backup_path = Some(record.path);
            }
            Err(err) => {
                backup_failed = true;
                trail.emit(Stage::Backup, Status::Failed, format!("failed: {err}"));
            }
        }
    } else {
        trail.emit(Stage::Backup, Status::Skipped, "disabled by options");
    }

    trail.emit(Stage::InitialCheck, Status::Running, "running normal check");
    let original = ctx.check();
    if original.is_valid() {
        trail.emit(Stage::InitialCheck, Status::Success, "store is healthy");
        let final_integrity = original.clone();
        return trail.finish(true, original, final_integrity, backup_path, start);
    }
    trail.emit(Stage::InitialCheck, Status::Warning, severity_note(&original));
    let mut current = original.clone();

    if current.severity() == Severity::Degraded && options.attempt_vacuum {
        match restrict_permissions(ctx.store.db_path()) {
            Ok(Some(previous)) => trail.emit(
                Stage::Vacuum,
                Status::Running,
                format!("file permissions reset to {STORE_FILE_MODE:04o} (was {previous:04o})"),
            ),
            Ok(None) => {}
            Err(err) => trail.emit(
                Stage::Vacuum,
                Status::Running,
                format!("file permission reset failed: {err}"),
            ),
        }
        trail.emit(Stage::Vacuum, Status::Running, "running REINDEX and VACUUM");
        match lightweight_repair(ctx.store) {
            Ok(()) => {
                current = ctx.check();
                if current.is_valid() {
                    trail.emit(Stage::Vacuum, Status::Success, "store is healthy");
                    return trail.finish(true, original, current, backup_path, start);
                }
                trail.emit(Stage::Vacuum, Status::Warning, severity_note(&current));
            }
            Err(err) => trail.emit(Stage::Vacuum, Status::Failed, format!("failed: {err}")),
        }
    } else {
        trail.emit(Stage::Vacuum, Status::Skipped, "not applicable");
    }

    if options.attempt_external_repair
        && matches!(current.severity(), Severity::Critical | Severity::Degraded)
    {
        trail.emit(
            Stage::ExternalRepair,
            Status::Running,
            format!("invoking {}", ctx.config.repair_tool.display()),
        );
        match invoke_repair_tool(ctx.store, ctx.config) {
            Ok(output) => {
                current = ctx.check();
                if current.is_valid() {
                    trail.emit(Stage::ExternalRepair, Status::Success, "store is healthy");
                    return trail.finish(true, original, current, backup_path, start);
                }
                let affirmation = if output.affirmed {
                    "tool reported ok"
                } else {
                    "tool did not report ok"
                };
                trail.emit(
                    Stage::ExternalRepair,
                    Status::Warning,
                    format!("{affirmation}; {}", severity_note(&current)),
                );
            }
            Err(err) => trail.emit(
                Stage::ExternalRepair,
                Status::Failed,
                format!("failed: {err}"),
            ),
        }
    } else {
        trail.emit(Stage::ExternalRepair, Status::Skipped, "not applicable");
    }

    if options.allow_recreate_structure
        && matches!(current.severity(), Severity::Critical | Severity::Degraded)
    {
        if backup_failed {
            trail.block(Stage::RecreateStructure);
        } else {
            trail.emit(
                Stage::RecreateStructure,
                Status::Running,
                "rebuilding canonical schema",
            );
            match reconstruct(ctx.store, ctx.config, options.attempt_data_recovery) {
                Ok(report) => {
                    current = ctx.check();
                    if current.is_valid() {
                        trail.emit(
                            Stage::RecreateStructure,
                            Status::Success,
                            report.summary(),
                        );
                        return trail.finish(true, original, current, backup_path, start);
                    }
                    trail.emit(
                        Stage::RecreateStructure,
                        Status::Warning,
                        format!("{}; {}", report.summary(), severity_note(&current)),
                    );
                }
                Err(err) => trail.emit(
                    Stage::RecreateStructure,
                    Status::Failed,
                    format!("rolled back: {err}"),
                ),
            }
        }
    } else {
        trail.emit(Stage::RecreateStructure, Status::Skipped, "not permitted or not applicable");
    }

    if options.allow_reset_database
        && matches!(current.severity(), Severity::Fatal | Severity::Critical)
    {
        if backup_failed {
            trail.block(Stage::Reset);
        } else {
            trail.emit(Stage::Reset, Status::Running, "removing store files");
            match reset_store(ctx.store, ctx.config) {
                Ok(report) if report.reinitialized => {
                    trail.emit(
                        Stage::Reset,
                        Status::Success,
                        format!("empty store created; previous data in {}", report.backup_path),
                    );
                    let final_integrity = IntegrityResult::healthy(json!({
                        "synthesized": true,
                        "reason": "store recreated empty",
                    }));
                    return trail.finish(true, original, final_integrity, backup_path, start);
                }
                Ok(report) => trail.emit(
                    Stage::Reset,
                    Status::Warning,
                    format!(
                        "store files removed but schema not re-created; previous data in {}",
                        report.backup_path
                    ),
                ),
                Err(err) => trail.emit(Stage::Reset, Status::Failed, format!("failed: {err}")),
            }
        }
    } else {
        trail.emit(Stage::Reset, Status::Skipped, "not permitted or not applicable");
    }

    trail.emit(Stage::FinalCheck, Status::Running, "running normal check");
    let final_integrity = ctx.check();
    let success = final_integrity.is_valid() || final_integrity.severity() < original.severity();
    let verdict = if final_integrity.is_valid() {
        "store is healthy".to_string()
    } else if success {
        format!(
            "improved from {} to {}",
            original.severity(),
            final_integrity.severity()
        )
    } else {
        format!("not recovered; {}", severity_note(&final_integrity))
    };
    trail.emit(
        Stage::FinalCheck,
        if success { Status::Success } else { Status::Failed },
        verdict,
    );
    trail.finish(success, original, final_integrity, backup_path, start)
}

/// Sets the store file to [`STORE_FILE_MODE`]. Returns the previous mode when
/// it had to change.
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    let previous = perms.mode() & 0o777;
    if previous == STORE_FILE_MODE {
        return Ok(None);
    }
    perms.set_mode(STORE_FILE_MODE);
    fs::set_permissions(path, perms)?;
    tracing::info!(
        target: "storemend",
        event = "db_permissions_reset",
        path = %path.display(),
        previous = %format!("{previous:04o}")
    );
    Ok(Some(previous))
}

#[cfg(not(unix))]
fn restrict_permissions(path: &Path) -> std::io::Result<Option<u32>> {
    fs::metadata(path).map(|_| None)
}

/// Rebuilds indexes inside a write transaction, then compacts. VACUUM is
/// rejected inside a transaction, so it runs on the bare writer.
fn lightweight_repair<S: StoreAccess>(store: &S) -> AppResult<()> {
    store.run_write_transaction(|tx| {
        tx.execute_batch("REINDEX;")?;
        Ok(())
    })?;
    store.run_exclusive(|conn| {
        conn.execute_batch("VACUUM;")?;
        Ok(())
    })
}
