use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use tracing::{debug, info};

use super::PolicyError;
use super::types::{ExecutionStatus, FinalStatus, PolicyExecutionResult, PolicyStepResult};
use crate::core::store::{self, RecordStore, StoreError};

const TABLE: &str = "policy_executions";
const COLUMNS: &str = "execution_id, agent_id, policy_id, status, total_steps, completed_steps, \
     current_step, step_results, final_status, error_summary, total_execution_time_ms, \
     started_at, completed_at, retry_count, reported_to_server";

/// Durable progress records for policy runs, one row per execution id.
#[derive(Clone)]
pub struct PolicyResultStore {
    store: RecordStore,
}

impl PolicyResultStore {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    /// Persist the whole record. A record that breaks its step invariants is
    /// refused before it reaches the store.
    pub async fn save(&self, result: &PolicyExecutionResult) -> Result<(), PolicyError> {
        result
            .check_invariants()
            .map_err(|reason| PolicyError::InvariantViolation {
                execution_id: result.execution_id.clone(),
                reason,
            })?;

        let step_results = serde_json::to_string(&result.step_results)?;
        let r = result.clone();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO policy_executions
                        (execution_id, agent_id, policy_id, status, total_steps, completed_steps,
                         current_step, step_results, final_status, error_summary,
                         total_execution_time_ms, started_at, completed_at, retry_count,
                         reported_to_server)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                     ON CONFLICT(execution_id) DO UPDATE SET
                        status = excluded.status,
                        completed_steps = excluded.completed_steps,
                        current_step = excluded.current_step,
                        step_results = excluded.step_results,
                        final_status = excluded.final_status,
                        error_summary = excluded.error_summary,
                        total_execution_time_ms = excluded.total_execution_time_ms,
                        completed_at = excluded.completed_at,
                        retry_count = excluded.retry_count,
                        reported_to_server = MAX(reported_to_server, excluded.reported_to_server)",
                    params![
                        r.execution_id,
                        r.agent_id,
                        r.policy_id,
                        r.status.as_str(),
                        r.total_steps,
                        r.completed_steps,
                        r.current_step,
                        step_results,
                        r.final_status.map(|s| s.as_str()),
                        r.error_summary,
                        r.total_execution_time_ms as i64,
                        store::to_millis(r.started_at),
                        r.completed_at.map(store::to_millis),
                        r.retry_count,
                        r.reported_to_server,
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!(
            "[policy] Saved {} progress {}/{} ({})",
            result.execution_id,
            result.completed_steps,
            result.total_steps,
            result.status.as_str()
        );
        Ok(())
    }

    pub async fn load(
        &self,
        execution_id: &str,
    ) -> Result<Option<PolicyExecutionResult>, PolicyError> {
        let exec = execution_id.to_string();
        let sql = format!("SELECT {} FROM policy_executions WHERE execution_id = ?1", COLUMNS);
        Ok(self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![exec])?;
                match rows.next()? {
                    Some(row) => Ok(Some(result_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    /// Flag the result as delivered upstream. Returns whether a row changed.
    pub async fn mark_reported(&self, execution_id: &str) -> Result<bool, PolicyError> {
        let exec = execution_id.to_string();
        let updated = self
            .store
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE policy_executions SET reported_to_server = 1
                     WHERE execution_id = ?1 AND reported_to_server = 0",
                    params![exec],
                )?)
            })
            .await?;
        if updated > 0 {
            debug!("[policy] {} reported to server", execution_id);
        }
        Ok(updated > 0)
    }

    /// Delete reported results that finished before `cutoff`.
    pub async fn purge_reported_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, PolicyError> {
        let cutoff = store::to_millis(cutoff);
        let deleted = self
            .store
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM policy_executions
                     WHERE reported_to_server = 1 AND status = 'completed' AND completed_at < ?1",
                    params![cutoff],
                )?)
            })
            .await?;
        if deleted > 0 {
            info!("[policy] Purged {} reported result(s)", deleted);
        }
        Ok(deleted)
    }

    /// Results left `running` by an interrupted drain.
    pub async fn list_running(&self) -> Result<Vec<PolicyExecutionResult>, PolicyError> {
        let sql = format!(
            "SELECT {} FROM policy_executions WHERE status = 'running' ORDER BY started_at ASC",
            COLUMNS
        );
        Ok(self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(result_from_row(row)?);
                }
                Ok(out)
            })
            .await?)
    }
}

fn result_from_row(row: &Row<'_>) -> Result<PolicyExecutionResult, StoreError> {
    let status: String = row.get(3)?;
    let status = ExecutionStatus::from_status(&status)
        .ok_or_else(|| StoreError::corrupt(TABLE, format!("unknown status '{}'", status)))?;
    let final_status: Option<String> = row.get(8)?;
    let final_status = final_status
        .map(|s| {
            FinalStatus::from_status(&s)
                .ok_or_else(|| StoreError::corrupt(TABLE, format!("unknown final status '{}'", s)))
        })
        .transpose()?;
    let steps: String = row.get(7)?;
    let step_results: Vec<PolicyStepResult> = serde_json::from_str(&steps)
        .map_err(|e| StoreError::corrupt(TABLE, format!("step_results: {}", e)))?;
    let total_ms: i64 = row.get(10)?;

    Ok(PolicyExecutionResult {
        execution_id: row.get(0)?,
        agent_id: row.get(1)?,
        policy_id: row.get(2)?,
        status,
        total_steps: row.get(4)?,
        completed_steps: row.get(5)?,
        current_step: row.get(6)?,
        step_results,
        final_status,
        error_summary: row.get(9)?,
        total_execution_time_ms: total_ms.max(0) as u64,
        started_at: store::from_millis(TABLE, row.get(11)?)?,
        completed_at: store::from_millis_opt(TABLE, row.get(12)?)?,
        retry_count: row.get(13)?,
        reported_to_server: row.get(14)?,
    })
}
