use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use storemend_lib::db::recovery::StageReport;
use storemend_lib::{
    BackupRecord, CheckLevel, EngineConfig, IntegrityResult, RecoveryEngine, RecoveryEvent,
    RecoveryOptions, RecoveryOutcome, SqliteStore, StageStatus,
};

const DB_ENV: &str = "STOREMEND_DB";

#[derive(Debug, Parser)]
#[command(
    name = "storemend",
    about = "Integrity checks and staged recovery for the session store",
    version
)]
struct Cli {
    /// Store file to operate on (defaults to $STOREMEND_DB, then the data dir).
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Also write JSON logs to a daily-rolling file in this directory.
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the read-only integrity diagnostics.
    Check {
        /// Scan depth: quick, normal or full.
        #[arg(long, default_value = "normal")]
        level: CheckLevel,
        /// Emit the raw JSON result instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Run the staged recovery pipeline.
    Recover(RecoverArgs),
    /// Copy the store file into the backups directory.
    Backup {
        /// Emit a machine-readable JSON object with the backup details.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Args)]
struct RecoverArgs {
    /// Skip the initial backup.
    #[arg(long)]
    no_backup: bool,
    /// Skip REINDEX/VACUUM on degraded stores.
    #[arg(long)]
    no_vacuum: bool,
    /// Skip the external repair utility.
    #[arg(long)]
    no_external_repair: bool,
    /// Permit rebuilding the canonical schema.
    #[arg(long)]
    allow_recreate: bool,
    /// Permit deleting the store and starting empty.
    #[arg(long)]
    allow_reset: bool,
    /// Do not carry rows across a schema rebuild.
    #[arg(long)]
    skip_data_recovery: bool,
    /// Emit the raw JSON outcome instead of the summary.
    #[arg(long)]
    json: bool,
}

impl RecoverArgs {
    fn options(&self) -> RecoveryOptions {
        RecoveryOptions {
            create_backup: !self.no_backup,
            attempt_vacuum: !self.no_vacuum,
            attempt_external_repair: !self.no_external_repair,
            allow_recreate_structure: self.allow_recreate,
            allow_reset_database: self.allow_reset,
            attempt_data_recovery: !self.skip_data_recovery,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _guard = match storemend_lib::logging::init_logging(cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    };
    tracing::debug!(target: "storemend", git = storemend_lib::GIT_HASH, "cli started");

    match handle_cli(cli).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

async fn handle_cli(cli: Cli) -> Result<i32> {
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path().context("determine database path")?,
    };
    let store = Arc::new(SqliteStore::new(&db_path));
    let engine = RecoveryEngine::new(store, EngineConfig::from_env());

    match cli.command {
        Commands::Check { level, json } => {
            let result = engine.check(level).await;
            if json {
                print_json(&result, "integrity result")?;
            } else {
                print_check_table(&db_path, &result);
            }
            Ok(if result.is_valid() { 0 } else { 1 })
        }
        Commands::Recover(args) => {
            let engine = if args.json {
                engine
            } else {
                engine.with_observer(Arc::new(print_progress))
            };
            let outcome = engine
                .recover(args.options())
                .await
                .context("run recovery pipeline")?;
            if args.json {
                print_json(&outcome, "recovery outcome")?;
            } else {
                print_outcome(&outcome);
            }
            Ok(if outcome.success { 0 } else { 1 })
        }
        Commands::Backup { json } => {
            let record = engine.backup().await.context("create backup")?;
            if json {
                print_json(&record, "backup record")?;
            } else {
                print_backup(&record);
            }
            Ok(0)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T, what: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(value).with_context(|| format!("serialize {what}"))?;
    println!("{json}");
    Ok(())
}

fn print_check_table(db_path: &std::path::Path, result: &IntegrityResult) {
    println!("Store integrity report");
    println!("Store        : {}", db_path.display());
    println!("Severity     : {}", result.severity());
    println!("Valid        : {}", if result.is_valid() { "yes" } else { "no" });
    println!("Checked at   : {}", result.timestamp().to_rfc3339());

    if result.errors().is_empty() {
        println!("\nErrors: none");
    } else {
        println!("\nErrors:");
        for error in result.errors() {
            println!("  - {}", error.replace('\n', " "));
        }
    }

    if !result.recommendations().is_empty() {
        println!("\nRecommendations:");
        for (idx, rec) in result.recommendations().iter().enumerate() {
            println!("  {}. {rec}", idx + 1);
        }
    }
}

fn status_label(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Running => "running",
        StageStatus::Success => "success",
        StageStatus::Warning => "warning",
        StageStatus::Skipped => "skipped",
        StageStatus::Failed => "failed",
    }
}

fn print_progress(event: RecoveryEvent) {
    let RecoveryEvent::Stage {
        stage,
        status,
        message,
    } = event;
    if status == StageStatus::Skipped {
        return;
    }
    eprintln!("[{:<18}] {:<8} {message}", stage.label(), status_label(status));
}

fn print_stage_row(report: &StageReport) {
    println!(
        "{:<20} {:<8} {}",
        report.stage.label(),
        status_label(report.status),
        report.message
    );
}

fn print_outcome(outcome: &RecoveryOutcome) {
    println!("Recovery {}", if outcome.success { "succeeded" } else { "failed" });
    println!(
        "Severity     : {} -> {}",
        outcome.original_integrity.severity(),
        outcome.final_integrity.severity()
    );
    println!(
        "Backup       : {}",
        outcome.backup_path.as_deref().unwrap_or("none")
    );
    println!("Duration     : {} ms", outcome.duration_ms);

    println!("\nStages:");
    println!("{:<20} {:<8} Message", "Stage", "Status");
    for report in &outcome.stages {
        print_stage_row(report);
    }

    if !outcome.final_integrity.errors().is_empty() {
        println!("\nRemaining errors:");
        for error in outcome.final_integrity.errors() {
            println!("  - {error}");
        }
    }
}

fn print_backup(record: &BackupRecord) {
    println!("Backup created");
    println!("Path         : {}", record.path);
    println!("Manifest     : {}", record.manifest_path);
    println!("Size (bytes) : {}", record.manifest.size_bytes);
    println!("SHA-256      : {}", record.manifest.sha256);
}

fn default_db_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(DB_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    let base = dirs::data_dir()
        .or_else(|| std::env::current_dir().ok())
        .ok_or_else(|| anyhow::anyhow!("failed to resolve application data directory"))?;
    Ok(base.join("storemend").join("appdata.db"))
}
