use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::policy::types::{PolicyDefinition, RawCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl InboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InboxStatus::Pending => "pending",
            InboxStatus::Completed => "completed",
            InboxStatus::Failed => "failed",
            InboxStatus::Expired => "expired",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(InboxStatus::Pending),
            "completed" => Some(InboxStatus::Completed),
            "failed" => Some(InboxStatus::Failed),
            "expired" => Some(InboxStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != InboxStatus::Pending
    }
}

impl std::fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statuses a caller may close a command with. Expiry is decided by the
/// inbox itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
}

impl From<TerminalStatus> for InboxStatus {
    fn from(value: TerminalStatus) -> Self {
        match value {
            TerminalStatus::Completed => InboxStatus::Completed,
            TerminalStatus::Failed => InboxStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    Command(RawCommand),
    Policy(PolicyDefinition),
}

impl CommandPayload {
    pub fn label(&self) -> &str {
        match self {
            CommandPayload::Command(c) => &c.command,
            CommandPayload::Policy(p) => &p.policy_id,
        }
    }
}

/// A command as delivered by the server. Validity is either an absolute
/// `expires_at` or a TTL counted from acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCommand {
    pub execution_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    pub payload: CommandPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxCommandRecord {
    pub id: i64,
    pub execution_id: String,
    pub agent_id: String,
    pub payload: CommandPayload,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: InboxStatus,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Stored(InboxCommandRecord),
    /// The execution id was already recorded; nothing changed.
    Duplicate,
}

impl AcceptOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AcceptOutcome::Duplicate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Applied,
    AlreadyTerminal(InboxStatus),
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InboxStats {
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
}
