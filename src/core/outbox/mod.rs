//! Durable queue of agent-generated records awaiting upload.
//!
//! Delivery is fetch-then-ack: [`OutboxManager::fetch_unsent`] hands out a
//! snapshot and [`OutboxManager::mark_sent`] records the server's answer per
//! row. A record that is fetched but never acked simply comes back on the next
//! cycle.

pub mod types;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::clock::Clock;
use crate::core::store::{self, RecordStore, StoreError};
pub use types::{
    Heartbeat, KindCounts, MarkSent, OutboxKind, OutboxPayload, OutboxRecord, OutboxStats,
};

const TABLE: &str = "outbox_records";
const COLUMNS: &str = "id, kind, agent_id, execution_id, payload, payload_bytes, created_at, \
     sent_to_server, server_sent_at, server_response_code, server_response_message";

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("failed to serialize {kind} payload: {source}")]
    Serialization {
        kind: OutboxKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("batch size must be at least 1")]
    EmptyBatch,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct OutboxManager {
    store: RecordStore,
    clock: Arc<dyn Clock>,
}

impl OutboxManager {
    pub fn new(store: RecordStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Serialize `payload` and queue it. A payload that cannot be serialized
    /// is a caller bug and nothing is written.
    pub async fn append<P: Serialize + ?Sized>(
        &self,
        kind: OutboxKind,
        agent_id: &str,
        payload: &P,
    ) -> Result<i64, OutboxError> {
        let body = serde_json::to_string(payload)
            .map_err(|source| OutboxError::Serialization { kind, source })?;
        self.insert(kind, agent_id, None, body).await
    }

    /// Queue a typed payload. Results carrying an execution id are stored at
    /// most once per id; a repeated append returns the existing row id.
    pub async fn append_payload(
        &self,
        agent_id: &str,
        payload: &OutboxPayload,
    ) -> Result<i64, OutboxError> {
        let kind = payload.kind();
        let body = payload
            .body_json()
            .map_err(|source| OutboxError::Serialization { kind, source })?;
        let execution_id = payload.execution_id().map(str::to_string);
        self.insert(kind, agent_id, execution_id, body).await
    }

    async fn insert(
        &self,
        kind: OutboxKind,
        agent_id: &str,
        execution_id: Option<String>,
        body: String,
    ) -> Result<i64, OutboxError> {
        let created_at = store::to_millis(self.clock.now());
        let payload_bytes = body.len() as i64;
        let agent_id = agent_id.to_string();

        let (id, reused) = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                if let Some(exec) = execution_id.as_deref() {
                    let existing: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM outbox_records WHERE execution_id = ?1 AND kind = ?2",
                            params![exec, kind.as_str()],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if let Some(id) = existing {
                        return Ok((id, true));
                    }
                }
                tx.execute(
                    "INSERT INTO outbox_records
                        (kind, agent_id, execution_id, payload, payload_bytes, created_at, sent_to_server)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                    params![
                        kind.as_str(),
                        agent_id,
                        execution_id,
                        body,
                        payload_bytes,
                        created_at
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok((id, false))
            })
            .await?;

        if reused {
            info!(
                "[outbox] {} record already queued as #{}, not appending again",
                kind, id
            );
        } else {
            debug!(
                "[outbox] Appended {} record #{} ({} bytes)",
                kind, id, payload_bytes
            );
        }
        Ok(id)
    }

    /// Oldest-first batch of unsent records of one kind for one agent.
    pub async fn fetch_unsent(
        &self,
        agent_id: &str,
        kind: OutboxKind,
        max_count: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        if max_count == 0 {
            return Err(OutboxError::EmptyBatch);
        }
        let agent_id = agent_id.to_string();
        let sql = format!(
            "SELECT {} FROM outbox_records
             WHERE agent_id = ?1 AND kind = ?2 AND sent_to_server = 0
             ORDER BY created_at ASC, id ASC LIMIT ?3",
            COLUMNS
        );
        Ok(self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![agent_id, kind.as_str(), max_count as i64])?;
                collect_records(&mut rows)
            })
            .await?)
    }

    /// Oldest-first batch of unsent records across every kind.
    pub async fn fetch_unsent_all(
        &self,
        agent_id: &str,
        max_count: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        if max_count == 0 {
            return Err(OutboxError::EmptyBatch);
        }
        let agent_id = agent_id.to_string();
        let sql = format!(
            "SELECT {} FROM outbox_records
             WHERE agent_id = ?1 AND sent_to_server = 0
             ORDER BY created_at ASC, id ASC LIMIT ?2",
            COLUMNS
        );
        Ok(self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![agent_id, max_count as i64])?;
                collect_records(&mut rows)
            })
            .await?)
    }

    /// Record the server's acknowledgement. Only the first ack is stored; any
    /// later call for the same row leaves it untouched.
    pub async fn mark_sent(
        &self,
        record_id: i64,
        response_code: u16,
        response_message: Option<&str>,
    ) -> Result<MarkSent, OutboxError> {
        let sent_at = store::to_millis(self.clock.now());
        let message = response_message.map(str::to_string);

        let outcome = self
            .store
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE outbox_records
                     SET sent_to_server = 1, server_sent_at = ?1,
                         server_response_code = ?2, server_response_message = ?3
                     WHERE id = ?4 AND sent_to_server = 0",
                    params![sent_at, response_code as i64, message, record_id],
                )?;
                if updated > 0 {
                    return Ok(MarkSent::Marked);
                }
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM outbox_records WHERE id = ?1",
                        params![record_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(if exists.is_some() {
                    MarkSent::AlreadySent
                } else {
                    MarkSent::Missing
                })
            })
            .await?;

        debug!("[outbox] mark_sent #{} -> {:?}", record_id, outcome);
        Ok(outcome)
    }

    /// Delete sent records created before `cutoff`. Unsent rows are never
    /// touched regardless of age.
    pub async fn purge_sent_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, OutboxError> {
        let cutoff = store::to_millis(cutoff);
        let deleted = self
            .store
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM outbox_records WHERE sent_to_server = 1 AND created_at < ?1",
                    params![cutoff],
                )?)
            })
            .await?;
        if deleted > 0 {
            info!("[outbox] Purged {} sent record(s)", deleted);
        }
        Ok(deleted)
    }

    pub async fn get(&self, record_id: i64) -> Result<Option<OutboxRecord>, OutboxError> {
        let sql = format!("SELECT {} FROM outbox_records WHERE id = ?1", COLUMNS);
        Ok(self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![record_id])?;
                Ok(collect_records(&mut rows)?.pop())
            })
            .await?)
    }

    /// The result record (script or policy) produced for an inbox command.
    pub async fn find_by_execution_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<OutboxRecord>, OutboxError> {
        let execution_id = execution_id.to_string();
        let sql = format!(
            "SELECT {} FROM outbox_records WHERE execution_id = ?1 ORDER BY id ASC LIMIT 1",
            COLUMNS
        );
        Ok(self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![execution_id])?;
                Ok(collect_records(&mut rows)?.pop())
            })
            .await?)
    }

    /// Most recent records regardless of state, newest first.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let sql = format!(
            "SELECT {} FROM outbox_records ORDER BY created_at DESC, id DESC LIMIT ?1",
            COLUMNS
        );
        Ok(self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![limit as i64])?;
                collect_records(&mut rows)
            })
            .await?)
    }

    pub async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let counts = self
            .store
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT kind, sent_to_server, COUNT(*) FROM outbox_records GROUP BY kind, sent_to_server",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        let mut stats = OutboxStats::default();
        for (kind, sent, count) in counts {
            let kind = OutboxKind::from_kind(&kind)
                .ok_or_else(|| StoreError::corrupt(TABLE, format!("unknown kind '{}'", kind)))?;
            let entry = stats.per_kind.entry(kind).or_default();
            if sent {
                entry.sent += count as u64;
            } else {
                entry.unsent += count as u64;
            }
        }
        Ok(stats)
    }
}

fn collect_records(rows: &mut rusqlite::Rows<'_>) -> Result<Vec<OutboxRecord>, StoreError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(record_from_row(row)?);
    }
    Ok(out)
}

fn record_from_row(row: &Row<'_>) -> Result<OutboxRecord, StoreError> {
    let kind: String = row.get(1)?;
    let kind = OutboxKind::from_kind(&kind)
        .ok_or_else(|| StoreError::corrupt(TABLE, format!("unknown kind '{}'", kind)))?;
    let code: Option<i64> = row.get(9)?;
    let server_response_code = code
        .map(|c| {
            u16::try_from(c)
                .map_err(|_| StoreError::corrupt(TABLE, format!("response code {} out of range", c)))
        })
        .transpose()?;

    Ok(OutboxRecord {
        id: row.get(0)?,
        kind,
        agent_id: row.get(2)?,
        execution_id: row.get(3)?,
        payload: row.get(4)?,
        payload_bytes: row.get(5)?,
        created_at: store::from_millis(TABLE, row.get(6)?)?,
        sent_to_server: row.get(7)?,
        server_sent_at: store::from_millis_opt(TABLE, row.get(8)?)?,
        server_response_code,
        server_response_message: row.get(10)?,
    })
}
