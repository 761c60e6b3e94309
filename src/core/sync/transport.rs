use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::inbox::IncomingCommand;
use crate::core::outbox::{OutboxKind, OutboxRecord};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("server answered {code}: {body}")]
    Status { code: u16, body: String },
    #[error("unexpected server response: {0}")]
    Decode(String),
}

/// One outbox row as it travels upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub record_id: i64,
    pub kind: OutboxKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub payload: serde_json::Value,
}

impl From<&OutboxRecord> for WireRecord {
    fn from(record: &OutboxRecord) -> Self {
        let payload = serde_json::from_str(&record.payload)
            .unwrap_or_else(|_| serde_json::Value::String(record.payload.clone()));
        Self {
            record_id: record.id,
            kind: record.kind,
            created_at: record.created_at,
            execution_id: record.execution_id.clone(),
            payload,
        }
    }
}

/// Ordered, kind-tagged batch for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadBatch {
    pub agent_id: String,
    pub records: Vec<WireRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAck {
    pub record_id: i64,
    pub status_code: u16,
    #[serde(default)]
    pub message: Option<String>,
}

impl RecordAck {
    /// A 5xx answer means the server could not take the record right now.
    pub fn is_retryable(&self) -> bool {
        self.status_code >= 500
    }
}

/// Wire protocol to the management server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn upload(&self, batch: &UploadBatch) -> Result<Vec<RecordAck>, TransportError>;

    async fn poll_commands(&self, agent_id: &str) -> Result<Vec<IncomingCommand>, TransportError>;
}
