use rusqlite::Connection;
use tracing::info;

pub(crate) const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS outbox_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    execution_id TEXT,
    payload TEXT NOT NULL,
    payload_bytes INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    sent_to_server INTEGER NOT NULL DEFAULT 0,
    server_sent_at INTEGER,
    server_response_code INTEGER,
    server_response_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_outbox_unsent
    ON outbox_records(agent_id, kind, sent_to_server, created_at);
CREATE INDEX IF NOT EXISTS idx_outbox_sent_created
    ON outbox_records(sent_to_server, created_at);
CREATE INDEX IF NOT EXISTS idx_outbox_execution_id
    ON outbox_records(execution_id) WHERE execution_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS inbox_commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL UNIQUE,
    agent_id TEXT NOT NULL,
    command_payload TEXT NOT NULL,
    issued_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_inbox_status_issued
    ON inbox_commands(status, issued_at);

CREATE TABLE IF NOT EXISTS policy_executions (
    execution_id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    policy_id TEXT NOT NULL,
    status TEXT NOT NULL,
    total_steps INTEGER NOT NULL,
    completed_steps INTEGER NOT NULL,
    current_step INTEGER NOT NULL,
    step_results TEXT NOT NULL,
    final_status TEXT,
    error_summary TEXT,
    total_execution_time_ms INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    reported_to_server INTEGER NOT NULL DEFAULT 0,
    CHECK (completed_steps <= total_steps)
);

CREATE TABLE IF NOT EXISTS credentials (
    provider TEXT PRIMARY KEY,
    blob TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// Bring the schema up to [`SCHEMA_VERSION`]. Safe to call on every open.
pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(SCHEMA_V1)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    info!(
        "[store] Schema migrated from v{} to v{}",
        current, SCHEMA_VERSION
    );
    Ok(())
}
