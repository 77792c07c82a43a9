use ::duckdb::{params, Connection};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

// Timestamps are stored as unix epoch milliseconds.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_block_state",
        sql: r#"
CREATE TABLE IF NOT EXISTS source_block (
    domain TEXT PRIMARY KEY,
    blocked_at BIGINT,
    blocked_until BIGINT,
    consecutive_count INTEGER NOT NULL DEFAULT 0,
    last_status_code INTEGER,
    last_error TEXT,
    last_attempt_at BIGINT
);

CREATE TABLE IF NOT EXISTS blocked_source (
    domain TEXT PRIMARY KEY,
    blocked_until BIGINT NOT NULL
);
"#,
    },
    Migration {
        version: "0002_collection_runs",
        sql: r#"
CREATE TABLE IF NOT EXISTS collection_run (
    id TEXT PRIMARY KEY,
    industry_id VARCHAR(64) NOT NULL,
    datapack_id VARCHAR(36) NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'pending',
    started_at BIGINT NOT NULL,
    completed_at BIGINT,
    companies_total INTEGER NOT NULL DEFAULT 0,
    companies_success INTEGER NOT NULL DEFAULT 0,
    companies_failed INTEGER NOT NULL DEFAULT 0,
    gate_passed BOOLEAN,
    error_count INTEGER NOT NULL DEFAULT 0,
    warning_count INTEGER NOT NULL DEFAULT 0,
    file_path TEXT,
    file_size_bytes BIGINT,
    duration_seconds BIGINT
);

CREATE SEQUENCE IF NOT EXISTS collection_error_id_seq START 1;

CREATE TABLE IF NOT EXISTS collection_error (
    id BIGINT PRIMARY KEY DEFAULT nextval('collection_error_id_seq'),
    collection_run_id TEXT NOT NULL,
    severity TEXT NOT NULL,
    error_code TEXT NOT NULL,
    error_message TEXT NOT NULL,
    error_path TEXT,
    ticker TEXT,
    created_at BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_collection_run_industry ON collection_run(industry_id, started_at);
CREATE INDEX IF NOT EXISTS idx_collection_error_run ON collection_error(collection_run_id);
"#,
    },
    Migration {
        version: "0003_companies_partial",
        sql: r#"
ALTER TABLE collection_run ADD COLUMN companies_partial INTEGER DEFAULT 0;
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            params![migration.version],
            |row| row.get(0),
        )?;

        if applied == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                params![migration.version],
            )?;
        }
    }

    Ok(())
}
