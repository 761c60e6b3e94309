use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::policy::types::{PolicyExecutionResult, ScriptExecutionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    Heartbeat,
    HardwareDiscovery,
    SoftwareDiscovery,
    SecurityDiscovery,
    ScriptExecution,
    PolicyResult,
}

impl OutboxKind {
    pub const ALL: [OutboxKind; 6] = [
        OutboxKind::Heartbeat,
        OutboxKind::HardwareDiscovery,
        OutboxKind::SoftwareDiscovery,
        OutboxKind::SecurityDiscovery,
        OutboxKind::ScriptExecution,
        OutboxKind::PolicyResult,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutboxKind::Heartbeat => "heartbeat",
            OutboxKind::HardwareDiscovery => "hardware_discovery",
            OutboxKind::SoftwareDiscovery => "software_discovery",
            OutboxKind::SecurityDiscovery => "security_discovery",
            OutboxKind::ScriptExecution => "script_execution",
            OutboxKind::PolicyResult => "policy_result",
        }
    }

    pub fn from_kind(value: &str) -> Option<Self> {
        match value {
            "heartbeat" => Some(OutboxKind::Heartbeat),
            "hardware_discovery" => Some(OutboxKind::HardwareDiscovery),
            "software_discovery" => Some(OutboxKind::SoftwareDiscovery),
            "security_discovery" => Some(OutboxKind::SecurityDiscovery),
            "script_execution" => Some(OutboxKind::ScriptExecution),
            "policy_result" => Some(OutboxKind::PolicyResult),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Periodic liveness report produced by the agent itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub hostname: String,
    pub username: String,
    pub os: String,
    pub agent_version: String,
    pub uptime_secs: u64,
    pub unsent_records: u64,
    pub pending_commands: u64,
    pub store_healthy: bool,
}

/// Typed view of every payload the agent uploads, keyed by kind. Discovery
/// payloads come from vendor collectors and stay opaque JSON documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum OutboxPayload {
    Heartbeat(Heartbeat),
    HardwareDiscovery(serde_json::Value),
    SoftwareDiscovery(serde_json::Value),
    SecurityDiscovery(serde_json::Value),
    ScriptExecution(ScriptExecutionResult),
    PolicyResult(PolicyExecutionResult),
}

impl OutboxPayload {
    pub fn kind(&self) -> OutboxKind {
        match self {
            OutboxPayload::Heartbeat(_) => OutboxKind::Heartbeat,
            OutboxPayload::HardwareDiscovery(_) => OutboxKind::HardwareDiscovery,
            OutboxPayload::SoftwareDiscovery(_) => OutboxKind::SoftwareDiscovery,
            OutboxPayload::SecurityDiscovery(_) => OutboxKind::SecurityDiscovery,
            OutboxPayload::ScriptExecution(_) => OutboxKind::ScriptExecution,
            OutboxPayload::PolicyResult(_) => OutboxKind::PolicyResult,
        }
    }

    /// Idempotency key linking this payload back to an inbox command.
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            OutboxPayload::ScriptExecution(r) => Some(&r.execution_id),
            OutboxPayload::PolicyResult(r) => Some(&r.execution_id),
            _ => None,
        }
    }

    /// Serialize only the kind-specific body, which is what the store keeps.
    pub(crate) fn body_json(&self) -> serde_json::Result<String> {
        match self {
            OutboxPayload::Heartbeat(v) => serde_json::to_string(v),
            OutboxPayload::HardwareDiscovery(v)
            | OutboxPayload::SoftwareDiscovery(v)
            | OutboxPayload::SecurityDiscovery(v) => serde_json::to_string(v),
            OutboxPayload::ScriptExecution(v) => serde_json::to_string(v),
            OutboxPayload::PolicyResult(v) => serde_json::to_string(v),
        }
    }

    pub fn decode(kind: OutboxKind, body: &str) -> serde_json::Result<Self> {
        Ok(match kind {
            OutboxKind::Heartbeat => OutboxPayload::Heartbeat(serde_json::from_str(body)?),
            OutboxKind::HardwareDiscovery => {
                OutboxPayload::HardwareDiscovery(serde_json::from_str(body)?)
            }
            OutboxKind::SoftwareDiscovery => {
                OutboxPayload::SoftwareDiscovery(serde_json::from_str(body)?)
            }
            OutboxKind::SecurityDiscovery => {
                OutboxPayload::SecurityDiscovery(serde_json::from_str(body)?)
            }
            OutboxKind::ScriptExecution => {
                OutboxPayload::ScriptExecution(serde_json::from_str(body)?)
            }
            OutboxKind::PolicyResult => OutboxPayload::PolicyResult(serde_json::from_str(body)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxRecord {
    pub id: i64,
    pub kind: OutboxKind,
    pub agent_id: String,
    pub execution_id: Option<String>,
    /// Serialized kind-specific body, opaque to the store.
    pub payload: String,
    pub payload_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub sent_to_server: bool,
    pub server_sent_at: Option<DateTime<Utc>>,
    pub server_response_code: Option<u16>,
    pub server_response_message: Option<String>,
}

impl OutboxRecord {
    pub fn decode(&self) -> serde_json::Result<OutboxPayload> {
        OutboxPayload::decode(self.kind, &self.payload)
    }
}

/// Result of a [`mark_sent`](super::OutboxManager::mark_sent) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkSent {
    Marked,
    AlreadySent,
    /// The row is gone, usually purged after an earlier successful upload.
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub unsent: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub per_kind: std::collections::BTreeMap<OutboxKind, KindCounts>,
}

impl OutboxStats {
    pub fn total_unsent(&self) -> u64 {
        self.per_kind.values().map(|c| c.unsent).sum()
    }

    pub fn total_sent(&self) -> u64 {
        self.per_kind.values().map(|c| c.sent).sum()
    }
}
