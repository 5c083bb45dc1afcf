//! Canonical schema contract for the session/job store.
//!
//! The DDL below is the end state the migration runner produces. The
//! integrity checker reads [`ESSENTIAL_TABLES`] from here and the
//! reconstructor replays [`CANONICAL_SCHEMA`], so both always agree on one
//! versioned contract.

/// Bumped whenever [`CANONICAL_SCHEMA`] changes shape.
pub const SCHEMA_VERSION: u32 = 4;

/// Tables the application cannot operate without.
pub const ESSENTIAL_TABLES: &[&str] = &[
    "sessions",
    "background_jobs",
    "key_value_store",
    "schema_migrations",
];

/// Tables whose rows are carried across a structural rebuild, parents first.
pub const KNOWN_TABLES: &[&str] = &[
    "sessions",
    "background_jobs",
    "key_value_store",
    "schema_migrations",
];

pub const CANONICAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    project_directory TEXT NOT NULL,
    project_hash TEXT NOT NULL,
    task_description TEXT DEFAULT NULL,
    search_term TEXT DEFAULT NULL,
    search_selected_files_only INTEGER NOT NULL DEFAULT 0 CHECK (search_selected_files_only IN (0, 1)),
    model_used TEXT DEFAULT NULL,
    included_files TEXT DEFAULT NULL,
    force_excluded_files TEXT DEFAULT NULL,
    video_analysis_prompt TEXT DEFAULT NULL,
    merge_instructions TEXT DEFAULT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_sessions_project_hash ON sessions(project_hash);
CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at);

CREATE TABLE IF NOT EXISTS background_jobs (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    task_type TEXT NOT NULL DEFAULT 'unknown',
    status TEXT NOT NULL DEFAULT 'created' CHECK (status IN (
        'idle', 'created', 'queued', 'acknowledged_by_worker', 'preparing',
        'preparing_input', 'generating_stream', 'processing_stream',
        'running', 'completed_by_tag', 'completed', 'failed', 'canceled'
    )),
    prompt TEXT NOT NULL DEFAULT '',
    response TEXT DEFAULT NULL,
    error_message TEXT DEFAULT NULL,
    tokens_sent INTEGER DEFAULT 0,
    tokens_received INTEGER DEFAULT 0,
    cache_write_tokens INTEGER DEFAULT 0,
    cache_read_tokens INTEGER DEFAULT 0,
    model_used TEXT DEFAULT NULL,
    actual_cost REAL DEFAULT NULL,
    metadata TEXT DEFAULT NULL,
    system_prompt_template TEXT DEFAULT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT NULL,
    start_time INTEGER DEFAULT NULL,
    end_time INTEGER DEFAULT NULL,
    is_finalized INTEGER NOT NULL DEFAULT 0 CHECK (is_finalized IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_background_jobs_session_id ON background_jobs(session_id);
CREATE INDEX IF NOT EXISTS idx_background_jobs_status ON background_jobs(status);
CREATE INDEX IF NOT EXISTS idx_background_jobs_created_at ON background_jobs(created_at);

CREATE TABLE IF NOT EXISTS key_value_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
"#;

/// Name of the temporary copy used while rebuilding `table`.
pub fn staging_table(table: &str) -> String {
    format!("staging_{table}")
}

/// Quotes an identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}
