//! Durable queue of server-issued commands awaiting execution.
//!
//! Each command moves `pending -> completed | failed | expired` exactly once.
//! Expiry is evaluated lazily whenever pending work is read, and eagerly by
//! the maintenance sweeper.

pub mod expiry;
pub mod types;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::store::{self, RecordStore, StoreError};
pub use expiry::{ExpiryEvaluation, evaluate_expiry};
pub use types::{
    AcceptOutcome, CommandPayload, InboxCommandRecord, InboxStats, InboxStatus, IncomingCommand,
    TerminalOutcome, TerminalStatus,
};

const TABLE: &str = "inbox_commands";
const COLUMNS: &str = "id, execution_id, agent_id, command_payload, issued_at, expires_at, \
     status, error_message, completed_at";

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("failed to serialize command payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("batch size must be at least 1")]
    EmptyBatch,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct InboxManager {
    store: RecordStore,
    clock: Arc<dyn Clock>,
    default_ttl: chrono::Duration,
}

impl InboxManager {
    pub fn new(store: RecordStore, clock: Arc<dyn Clock>, default_ttl: chrono::Duration) -> Self {
        Self {
            store,
            clock,
            default_ttl,
        }
    }

    /// Record a command unless its execution id is already known. A duplicate
    /// leaves the stored command exactly as it was.
    pub async fn accept(&self, command: &IncomingCommand) -> Result<AcceptOutcome, InboxError> {
        if command.execution_id.trim().is_empty() {
            return Err(InboxError::InvalidCommand(
                "execution_id must not be empty".to_string(),
            ));
        }
        if command.agent_id.trim().is_empty() {
            return Err(InboxError::InvalidCommand(
                "agent_id must not be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let issued_at = command.issued_at.unwrap_or(now);
        let expires_at = self.resolve_deadline(command, now)?;
        let body = serde_json::to_string(&command.payload)?;

        let execution_id = command.execution_id.clone();
        let agent_id = command.agent_id.clone();
        let (issued_ms, expires_ms) = (store::to_millis(issued_at), store::to_millis(expires_at));

        let inserted = self
            .store
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT INTO inbox_commands
                        (execution_id, agent_id, command_payload, issued_at, expires_at, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending')
                     ON CONFLICT(execution_id) DO NOTHING",
                    params![execution_id, agent_id, body, issued_ms, expires_ms],
                )?;
                Ok((changed > 0).then(|| conn.last_insert_rowid()))
            })
            .await?;

        match inserted {
            Some(id) => {
                info!(
                    "[inbox] Accepted command {} ({}) expiring at {}",
                    command.execution_id,
                    command.payload.label(),
                    expires_at
                );
                Ok(AcceptOutcome::Stored(InboxCommandRecord {
                    id,
                    execution_id: command.execution_id.clone(),
                    agent_id: command.agent_id.clone(),
                    payload: command.payload.clone(),
                    issued_at: store::from_millis(TABLE, issued_ms)?,
                    expires_at: store::from_millis(TABLE, expires_ms)?,
                    status: InboxStatus::Pending,
                    error_message: None,
                    completed_at: None,
                }))
            }
            None => {
                debug!(
                    "[inbox] Command {} already recorded, ignoring resend",
                    command.execution_id
                );
                Ok(AcceptOutcome::Duplicate)
            }
        }
    }

    fn resolve_deadline(
        &self,
        command: &IncomingCommand,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, InboxError> {
        if let Some(at) = command.expires_at {
            return Ok(at);
        }
        let ttl = match command.ttl_seconds {
            Some(secs) => i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .ok_or_else(|| {
                    InboxError::InvalidCommand(format!("ttl_seconds {} out of range", secs))
                })?,
            None => self.default_ttl,
        };
        now.checked_add_signed(ttl)
            .ok_or_else(|| InboxError::InvalidCommand("ttl overflows the calendar".to_string()))
    }

    /// Oldest-issued pending commands that are still valid. Stale entries met
    /// on the way are flipped to `expired` as part of the same read; rows past
    /// the first `max_count` live ones are never loaded.
    pub async fn fetch_pending(
        &self,
        max_count: usize,
    ) -> Result<Vec<InboxCommandRecord>, InboxError> {
        if max_count == 0 {
            return Err(InboxError::EmptyBatch);
        }
        let now = self.clock.now();
        let now_ms = store::to_millis(now);
        let sql = format!(
            "SELECT {} FROM inbox_commands WHERE status = 'pending'
             ORDER BY issued_at ASC, id ASC LIMIT ?1 OFFSET ?2",
            COLUMNS
        );

        let (live, expired, unreadable) = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut live: Vec<InboxCommandRecord> = Vec::new();
                let mut expired = 0usize;
                let mut unreadable = 0usize;

                // Expired and unreadable rows leave the pending set, so each
                // page either fills the batch or shrinks what is left to scan.
                while live.len() < max_count {
                    let mut page = Vec::new();
                    let mut bad = Vec::new();
                    {
                        let mut stmt = tx.prepare(&sql)?;
                        let mut rows = stmt.query(params![
                            (max_count - live.len()) as i64,
                            live.len() as i64
                        ])?;
                        while let Some(row) = rows.next()? {
                            match record_from_row(row) {
                                Ok(record) => page.push(record),
                                Err(RowError::Undecodable { id, reason }) => bad.push((id, reason)),
                                Err(RowError::Store(e)) => return Err(e),
                            }
                        }
                    }
                    if page.is_empty() && bad.is_empty() {
                        break;
                    }

                    let eval = evaluate_expiry(now, page);
                    for record in &eval.expired {
                        tx.execute(
                            "UPDATE inbox_commands SET status = 'expired', completed_at = ?1
                             WHERE id = ?2 AND status = 'pending'",
                            params![now_ms, record.id],
                        )?;
                    }
                    for (id, reason) in &bad {
                        tx.execute(
                            "UPDATE inbox_commands SET status = 'failed', completed_at = ?1, error_message = ?2
                             WHERE id = ?3 AND status = 'pending'",
                            params![now_ms, format!("unreadable command payload: {}", reason), id],
                        )?;
                    }
                    expired += eval.expired.len();
                    unreadable += bad.len();
                    live.extend(eval.live);
                }
                tx.commit()?;
                Ok((live, expired, unreadable))
            })
            .await?;

        if expired > 0 {
            info!("[inbox] Lazily expired {} stale command(s)", expired);
        }
        if unreadable > 0 {
            warn!(
                "[inbox] Failed {} command(s) with unreadable payloads",
                unreadable
            );
        }
        Ok(live)
    }

    /// Close a pending command. A command that is already terminal (for
    /// example expired while a slow execution was still running) keeps its
    /// status and the call is a no-op.
    pub async fn mark_terminal(
        &self,
        execution_id: &str,
        status: TerminalStatus,
        error_message: Option<&str>,
    ) -> Result<TerminalOutcome, InboxError> {
        let target: InboxStatus = status.into();
        let now_ms = store::to_millis(self.clock.now());
        let exec = execution_id.to_string();
        let message = error_message.map(str::to_string);

        let outcome = self
            .store
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE inbox_commands SET status = ?1, error_message = ?2, completed_at = ?3
                     WHERE execution_id = ?4 AND status = 'pending'",
                    params![target.as_str(), message, now_ms, exec],
                )?;
                if updated > 0 {
                    return Ok(TerminalOutcome::Applied);
                }
                let current: Option<String> = conn
                    .query_row(
                        "SELECT status FROM inbox_commands WHERE execution_id = ?1",
                        params![exec],
                        |row| row.get(0),
                    )
                    .optional()?;
                match current {
                    None => Ok(TerminalOutcome::NotFound),
                    Some(s) => InboxStatus::from_status(&s)
                        .map(TerminalOutcome::AlreadyTerminal)
                        .ok_or_else(|| StoreError::corrupt(TABLE, format!("unknown status '{}'", s))),
                }
            })
            .await?;

        match outcome {
            TerminalOutcome::Applied => {
                info!("[inbox] Command {} marked {}", execution_id, target)
            }
            TerminalOutcome::AlreadyTerminal(current) => warn!(
                "[inbox] Command {} is already {}, ignoring transition to {}",
                execution_id, current, target
            ),
            TerminalOutcome::NotFound => {
                warn!("[inbox] Command {} not found, cannot mark {}", execution_id, target)
            }
        }
        Ok(outcome)
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<InboxCommandRecord>, InboxError> {
        let exec = execution_id.to_string();
        let sql = format!("SELECT {} FROM inbox_commands WHERE execution_id = ?1", COLUMNS);
        Ok(self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![exec])?;
                match rows.next()? {
                    Some(row) => Ok(Some(record_from_row(row).map_err(RowError::into_store)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    /// Eager expiry pass: flip every pending command whose deadline passed.
    pub async fn expire_stale(&self) -> Result<usize, InboxError> {
        let now_ms = store::to_millis(self.clock.now());
        let expired = self
            .store
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE inbox_commands SET status = 'expired', completed_at = ?1
                     WHERE status = 'pending' AND expires_at < ?1",
                    params![now_ms],
                )?)
            })
            .await?;
        if expired > 0 {
            info!("[inbox] Expired {} stale command(s)", expired);
        }
        Ok(expired)
    }

    /// Delete terminal commands closed before `cutoff`. Pending rows stay.
    pub async fn purge_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, InboxError> {
        let cutoff = store::to_millis(cutoff);
        let deleted = self
            .store
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM inbox_commands
                     WHERE status != 'pending' AND COALESCE(completed_at, issued_at) < ?1",
                    params![cutoff],
                )?)
            })
            .await?;
        if deleted > 0 {
            info!("[inbox] Purged {} terminal command(s)", deleted);
        }
        Ok(deleted)
    }

    /// Most recently issued commands, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<InboxStatus>,
        limit: usize,
    ) -> Result<Vec<InboxCommandRecord>, InboxError> {
        let sql = format!(
            "SELECT {} FROM inbox_commands WHERE (?1 IS NULL OR status = ?1)
             ORDER BY issued_at DESC, id DESC LIMIT ?2",
            COLUMNS
        );
        let status = status.map(|s| s.as_str());
        Ok(self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![status, limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(record_from_row(row).map_err(RowError::into_store)?);
                }
                Ok(out)
            })
            .await?)
    }

    pub async fn stats(&self) -> Result<InboxStats, InboxError> {
        let counts = self
            .store
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM inbox_commands GROUP BY status")?;
                let rows =
                    stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        let mut stats = InboxStats::default();
        for (status, count) in counts {
            let count = count as u64;
            match InboxStatus::from_status(&status) {
                Some(InboxStatus::Pending) => stats.pending = count,
                Some(InboxStatus::Completed) => stats.completed = count,
                Some(InboxStatus::Failed) => stats.failed = count,
                Some(InboxStatus::Expired) => stats.expired = count,
                None => {
                    return Err(
                        StoreError::corrupt(TABLE, format!("unknown status '{}'", status)).into(),
                    );
                }
            }
        }
        Ok(stats)
    }
}

enum RowError {
    Undecodable { id: i64, reason: String },
    Store(StoreError),
}

impl RowError {
    fn into_store(self) -> StoreError {
        match self {
            RowError::Undecodable { reason, .. } => StoreError::corrupt(TABLE, reason),
            RowError::Store(e) => e,
        }
    }
}

impl From<rusqlite::Error> for RowError {
    fn from(e: rusqlite::Error) -> Self {
        RowError::Store(e.into())
    }
}

impl From<StoreError> for RowError {
    fn from(e: StoreError) -> Self {
        RowError::Store(e)
    }
}

fn record_from_row(row: &Row<'_>) -> Result<InboxCommandRecord, RowError> {
    let id: i64 = row.get(0)?;
    let body: String = row.get(3)?;
    let payload: CommandPayload =
        serde_json::from_str(&body).map_err(|e| RowError::Undecodable {
            id,
            reason: e.to_string(),
        })?;
    let status: String = row.get(6)?;
    let status = InboxStatus::from_status(&status).ok_or_else(|| RowError::Undecodable {
        id,
        reason: format!("unknown status '{}'", status),
    })?;

    Ok(InboxCommandRecord {
        id,
        execution_id: row.get(1)?,
        agent_id: row.get(2)?,
        payload,
        issued_at: store::from_millis(TABLE, row.get(4)?)?,
        expires_at: store::from_millis(TABLE, row.get(5)?)?,
        status,
        error_message: row.get(7)?,
        completed_at: store::from_millis_opt(TABLE, row.get(8)?)?,
    })
}
