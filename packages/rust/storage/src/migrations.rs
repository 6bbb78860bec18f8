//! SQL migration definitions for the Showrunner database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: cache_entries, runs, checkpoints",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Content-addressed results (scripts, audio). Write-once per key.
CREATE TABLE IF NOT EXISTS cache_entries (
    id            TEXT PRIMARY KEY,
    cache_key     TEXT NOT NULL UNIQUE,
    kind          TEXT NOT NULL,
    metadata_json TEXT,
    payload       BLOB NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_kind ON cache_entries(kind);

-- One row per pipeline run, keyed by the run fingerprint
CREATE TABLE IF NOT EXISTS runs (
    run_key      TEXT PRIMARY KEY,
    episode_id   TEXT NOT NULL,
    state        TEXT NOT NULL,
    failed_stage TEXT,
    last_error   TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_episode ON runs(episode_id);

-- Stage outputs committed by a run
CREATE TABLE IF NOT EXISTS checkpoints (
    run_key      TEXT NOT NULL REFERENCES runs(run_key) ON DELETE CASCADE,
    name         TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (run_key, name)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
