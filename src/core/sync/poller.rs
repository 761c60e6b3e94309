use std::sync::Arc;

use tracing::{info, warn};

use super::SyncError;
use super::transport::Transport;
use crate::core::inbox::{AcceptOutcome, InboxError, InboxManager};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub received: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Pulls server-issued commands into the inbox.
pub struct CommandPoller {
    inbox: InboxManager,
    transport: Arc<dyn Transport>,
    agent_id: String,
}

impl CommandPoller {
    pub fn new(inbox: InboxManager, transport: Arc<dyn Transport>, agent_id: &str) -> Self {
        Self {
            inbox,
            transport,
            agent_id: agent_id.to_string(),
        }
    }

    pub async fn poll_once(&self) -> Result<PollReport, SyncError> {
        let commands = self.transport.poll_commands(&self.agent_id).await?;
        let mut report = PollReport {
            received: commands.len(),
            ..PollReport::default()
        };

        for mut command in commands {
            if command.agent_id.is_empty() {
                command.agent_id = self.agent_id.clone();
            } else if command.agent_id != self.agent_id {
                warn!(
                    "[sync] Command {} addressed to {}, not this agent",
                    command.execution_id, command.agent_id
                );
                report.rejected += 1;
                continue;
            }

            match self.inbox.accept(&command).await {
                Ok(AcceptOutcome::Stored(_)) => report.accepted += 1,
                Ok(AcceptOutcome::Duplicate) => report.duplicates += 1,
                Err(InboxError::InvalidCommand(reason)) => {
                    warn!("[sync] Dropping malformed command: {}", reason);
                    report.rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if report.received > 0 {
            info!(
                "[sync] Received {} command(s): {} new, {} duplicate, {} rejected",
                report.received, report.accepted, report.duplicates, report.rejected
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::inbox::{CommandPayload, IncomingCommand, InboxStatus};
    use crate::core::policy::types::RawCommand;
    use crate::core::store::RecordStore;
    use crate::core::sync::fake::FakeTransport;
    use crate::core::sync::transport::TransportError;

    fn command(execution_id: &str, agent_id: &str) -> IncomingCommand {
        IncomingCommand {
            execution_id: execution_id.to_string(),
            agent_id: agent_id.to_string(),
            issued_at: None,
            expires_at: None,
            ttl_seconds: Some(600),
            payload: CommandPayload::Command(RawCommand {
                command: "whoami".to_string(),
                args: Vec::new(),
                env: Default::default(),
                timeout_secs: None,
            }),
        }
    }

    fn setup() -> (CommandPoller, InboxManager, Arc<FakeTransport>) {
        let store = RecordStore::open_in_memory().unwrap();
        let inbox = InboxManager::new(
            store,
            Arc::new(ManualClock::starting_now()),
            chrono::Duration::hours(1),
        );
        let transport = Arc::new(FakeTransport::default());
        let poller = CommandPoller::new(inbox.clone(), transport.clone(), "agent-1");
        (poller, inbox, transport)
    }

    #[tokio::test]
    async fn resent_commands_count_as_duplicates() {
        let (poller, inbox, transport) = setup();
        transport.answer_poll(Ok(vec![command("E1", "agent-1")]));
        transport.answer_poll(Ok(vec![command("E1", "agent-1"), command("E2", "")]));

        let first = poller.poll_once().await.unwrap();
        assert_eq!(first.accepted, 1);

        let second = poller.poll_once().await.unwrap();
        assert_eq!(second.accepted, 1);
        assert_eq!(second.duplicates, 1);

        let e2 = inbox.get("E2").await.unwrap().unwrap();
        assert_eq!(e2.agent_id, "agent-1");
        assert_eq!(e2.status, InboxStatus::Pending);
    }

    #[tokio::test]
    async fn foreign_and_malformed_commands_are_rejected() {
        let (poller, inbox, transport) = setup();
        transport.answer_poll(Ok(vec![command("E1", "agent-9"), command("", "agent-1")]));

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.rejected, 2);
        assert_eq!(inbox.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn transport_failure_is_surfaced() {
        let (poller, _inbox, transport) = setup();
        transport.answer_poll(Err(TransportError::Status {
            code: 502,
            body: "bad gateway".to_string(),
        }));
        assert!(matches!(
            poller.poll_once().await,
            Err(SyncError::Transport(TransportError::Status { code: 502, .. }))
        ));
    }
}
