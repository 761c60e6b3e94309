//! Periodic maintenance: eager expiry, retention purge and compaction.

use std::sync::Arc;

use tracing::{info, warn};

use crate::core::clock::Clock;
use crate::core::inbox::InboxManager;
use crate::core::outbox::OutboxManager;
use crate::core::policy::PolicyResultStore;
use crate::core::store::RecordStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub outbox_purged: usize,
    pub inbox_purged: usize,
    pub results_purged: usize,
    pub compacted: bool,
    /// Phases that failed this pass; they are retried on the next one.
    pub failed_phases: Vec<&'static str>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed_phases.is_empty()
    }
}

pub struct MaintenanceSweeper {
    store: RecordStore,
    inbox: InboxManager,
    outbox: OutboxManager,
    results: PolicyResultStore,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
}

impl MaintenanceSweeper {
    pub fn new(
        store: RecordStore,
        inbox: InboxManager,
        outbox: OutboxManager,
        results: PolicyResultStore,
        clock: Arc<dyn Clock>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            store,
            inbox,
            outbox,
            results,
            clock,
            retention,
        }
    }

    /// One full pass. Never fails; a failing phase is logged and skipped.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = self.clock.now() - self.retention;

        match self.inbox.expire_stale().await {
            Ok(n) => report.expired = n,
            Err(e) => {
                warn!("[sweeper] Expiry pass failed: {}", e);
                report.failed_phases.push("expire");
            }
        }
        match self.outbox.purge_sent_older_than(cutoff).await {
            Ok(n) => report.outbox_purged = n,
            Err(e) => {
                warn!("[sweeper] Outbox purge failed: {}", e);
                report.failed_phases.push("outbox_purge");
            }
        }
        match self.inbox.purge_terminal_older_than(cutoff).await {
            Ok(n) => report.inbox_purged = n,
            Err(e) => {
                warn!("[sweeper] Inbox purge failed: {}", e);
                report.failed_phases.push("inbox_purge");
            }
        }
        match self.results.purge_reported_older_than(cutoff).await {
            Ok(n) => report.results_purged = n,
            Err(e) => {
                warn!("[sweeper] Policy result purge failed: {}", e);
                report.failed_phases.push("results_purge");
            }
        }
        match self.store.compact().await {
            Ok(()) => report.compacted = true,
            Err(e) => {
                warn!("[sweeper] Compaction failed: {}", e);
                report.failed_phases.push("compact");
            }
        }

        info!(
            "[sweeper] Pass done: {} expired, purged {} outbox / {} inbox / {} result(s){}",
            report.expired,
            report.outbox_purged,
            report.inbox_purged,
            report.results_purged,
            if report.is_clean() {
                String::new()
            } else {
                format!(", failed: {}", report.failed_phases.join(", "))
            }
        );
        report
    }
}
