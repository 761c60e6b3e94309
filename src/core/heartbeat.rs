use std::time::Instant;

use tracing::debug;

use crate::core::inbox::InboxManager;
use crate::core::outbox::{Heartbeat, OutboxError, OutboxManager, OutboxPayload};
use crate::core::store::RecordStore;

/// Queues periodic liveness records describing this agent.
pub struct HeartbeatProducer {
    store: RecordStore,
    outbox: OutboxManager,
    inbox: InboxManager,
    agent_id: String,
    started: Instant,
}

impl HeartbeatProducer {
    pub fn new(
        store: RecordStore,
        outbox: OutboxManager,
        inbox: InboxManager,
        agent_id: &str,
    ) -> Self {
        Self {
            store,
            outbox,
            inbox,
            agent_id: agent_id.to_string(),
            started: Instant::now(),
        }
    }

    pub async fn snapshot(&self) -> Heartbeat {
        // Queue depths are informational; a failed count reads as zero.
        let unsent_records = self
            .outbox
            .stats()
            .await
            .map(|s| s.total_unsent())
            .unwrap_or(0);
        let pending_commands = self.inbox.stats().await.map(|s| s.pending).unwrap_or(0);

        Heartbeat {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown-host".to_string()),
            username: whoami::username(),
            os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            unsent_records,
            pending_commands,
            store_healthy: self.store.health().is_healthy(),
        }
    }

    pub async fn produce_once(&self) -> Result<i64, OutboxError> {
        let heartbeat = self.snapshot().await;
        let id = self
            .outbox
            .append_payload(&self.agent_id, &OutboxPayload::Heartbeat(heartbeat))
            .await?;
        debug!("[heartbeat] Queued heartbeat #{}", id);
        Ok(id)
    }
}
