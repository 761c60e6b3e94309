//! Durable record store: a crash-safe SQLite database local to the process.
//!
//! The store knows nothing about outbox or inbox semantics. It owns the
//! connection, the schema and the health breaker, and hands managers a
//! connection for the duration of one short closure. No caller may hold the
//! connection across network I/O or step execution.

pub mod health;
mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::platform::{NativePlatform, Platform};
pub use health::{HealthConfig, HealthSnapshot, StoreHealth};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record store unavailable after {failures} consecutive failure(s)")]
    Unavailable { failures: u32 },
    #[error("timed out after {0:?} waiting for the record store")]
    LockTimeout(Duration),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    fn affects_health(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code != ErrorCode::ConstraintViolation
            }
            StoreError::Io(_) => true,
            _ => false,
        }
    }

    pub(crate) fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            table,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
    pub health: HealthConfig,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            health: HealthConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Mutex<Connection>>,
    health: Arc<StoreHealth>,
    lock_timeout: Duration,
    path: Option<PathBuf>,
}

impl RecordStore {
    /// Open (or create) the store file at `path` and apply the schema.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
            NativePlatform::restrict_dir_permissions(parent);
        }

        let conn = Connection::open(path)?;
        NativePlatform::restrict_file_permissions(path);

        conn.busy_timeout(options.busy_timeout)?;
        // auto_vacuum only takes effect before the first table exists.
        conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        schema::migrate(&conn)?;

        info!(
            "[store] Opened record store at {} (journal_mode={})",
            path.display(),
            mode
        );
        Ok(Self::from_connection(conn, options).with_path(path))
    }

    /// Open a private in-memory store. Nothing survives the process.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
        schema::migrate(&conn)?;
        Ok(Self::from_connection(conn, StoreOptions::default()))
    }

    fn from_connection(conn: Connection, options: StoreOptions) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            health: Arc::new(StoreHealth::new(options.health)),
            // Lock waits are bounded a little beyond SQLite's own busy timeout.
            lock_timeout: options.busy_timeout + Duration::from_secs(1),
            path: None,
        }
    }

    fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Run `op` against the connection. The closure must be short: it holds
    /// the store lock for its whole duration.
    pub async fn call<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        self.health.admit()?;

        let mut conn = match tokio::time::timeout(self.lock_timeout, self.db.lock()).await {
            Ok(conn) => conn,
            Err(_) => {
                self.health.release_trial();
                return Err(StoreError::LockTimeout(self.lock_timeout));
            }
        };

        let result = op(&mut conn);
        drop(conn);

        match &result {
            Ok(_) => self.health.record_success(),
            Err(e) if e.affects_health() => {
                debug!("[store] Call failed and counts against health: {}", e);
                self.health.record_failure();
            }
            Err(_) => self.health.release_trial(),
        }
        result
    }

    /// Reclaim free pages and fold the WAL back into the main file.
    pub async fn compact(&self) -> Result<(), StoreError> {
        self.call(|conn| {
            drain_pragma(conn, "PRAGMA incremental_vacuum")?;
            drain_pragma(conn, "PRAGMA wal_checkpoint(TRUNCATE)")?;
            Ok(())
        })
        .await
    }
}

#[async_trait::async_trait]
impl crate::core::lifecycle::LifecycleComponent for RecordStore {
    async fn on_shutdown(&self) -> anyhow::Result<()> {
        self.compact().await?;
        info!("[store] Checkpointed record store");
        Ok(())
    }
}

/// Execute a pragma that may or may not produce rows.
fn drain_pragma(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(table: &'static str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::corrupt(table, format!("timestamp out of range: {}", millis)))
}

pub(crate) fn from_millis_opt(
    table: &'static str,
    millis: Option<i64>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    millis.map(|m| from_millis(table, m)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_has_schema() {
        let store = RecordStore::open_in_memory().unwrap();
        let tables: Vec<String> = store
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
            })
            .await
            .unwrap();
        assert_eq!(
            tables,
            vec![
                "credentials",
                "inbox_commands",
                "outbox_records",
                "policy_executions"
            ]
        );
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = RecordStore::open_in_memory().unwrap();
        store
            .call(|conn| Ok(schema::migrate(conn)?))
            .await
            .unwrap();
        let version: i64 = store
            .call(|conn| Ok(conn.query_row("PRAGMA user_version", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("outpost.db");

        let store = RecordStore::open(&path, StoreOptions::default()).unwrap();
        store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO credentials (provider, blob, updated_at) VALUES ('aws', 'x', 1)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        drop(store);

        let reopened = RecordStore::open(&path, StoreOptions::default()).unwrap();
        let count: i64 = reopened
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM credentials", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(reopened.path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn constraint_violation_does_not_trip_breaker() {
        let store = RecordStore::open_in_memory().unwrap();
        for _ in 0..10 {
            let _ = store
                .call(|conn| {
                    conn.execute(
                        "INSERT INTO credentials (provider, blob, updated_at) VALUES ('dup', 'x', 1)",
                        [],
                    )?;
                    Ok(())
                })
                .await;
        }
        assert!(store.health().is_healthy());
    }

    #[tokio::test]
    async fn repeated_sqlite_faults_open_breaker() {
        let store = RecordStore::open_in_memory().unwrap();
        for _ in 0..HealthConfig::default().failure_threshold {
            let err = store
                .call(|conn| {
                    conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
                    Ok(())
                })
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::Sqlite(_)));
        }

        let err = store.call(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn compact_runs_on_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(&dir.path().join("c.db"), StoreOptions::default()).unwrap();
        store.compact().await.unwrap();
    }

    #[test]
    fn millis_round_trip() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(from_millis("t", to_millis(at)).unwrap(), at);
        assert!(from_millis("t", i64::MAX).is_err());
    }
}
