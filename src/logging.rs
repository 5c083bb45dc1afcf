use std::env;
use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_ENV: &str = "STOREMEND_LOG";
pub const LOG_FORMAT_ENV: &str = "STOREMEND_LOG_FORMAT";
pub const DEFAULT_DIRECTIVES: &str = "storemend=info";
const LOG_FILE_PREFIX: &str = "storemend.log";

/// Picks filter directives: `RUST_LOG`, then `STOREMEND_LOG`, then the default.
pub fn filter_directives(rust_log: Option<String>, storemend_log: Option<String>) -> String {
    rust_log
        .filter(|value| !value.trim().is_empty())
        .or_else(|| storemend_log.filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_string())
}

fn wants_json() -> bool {
    env::var(LOG_FORMAT_ENV)
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Installs the global subscriber: stderr output, plus a daily-rolling JSON
/// file under `log_dir` when given. Keep the returned guard alive until exit
/// so buffered file lines are flushed.
pub fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let directives = filter_directives(env::var("RUST_LOG").ok(), env::var(LOG_ENV).ok());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("parse log filter '{directives}'"))?;

    let stderr_layer = if wants_json() {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;

    Ok(guard)
}
