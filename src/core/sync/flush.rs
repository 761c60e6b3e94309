use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::SyncError;
use super::transport::{Transport, UploadBatch, WireRecord};
use crate::core::outbox::{MarkSent, OutboxKind, OutboxManager, OutboxRecord};
use crate::core::policy::PolicyResultStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub fetched: usize,
    /// Acked and recorded as sent, including permanent rejections.
    pub marked: usize,
    /// Of `marked`, how many the server refused with a 4xx.
    pub rejected: usize,
    /// 5xx answers; the records stay queued.
    pub retry_later: usize,
    /// Records the server did not answer for.
    pub unacked: usize,
    pub already_sent: usize,
}

/// Moves unsent outbox records upstream, one bounded batch per call.
pub struct FlushWorker {
    outbox: OutboxManager,
    results: PolicyResultStore,
    transport: Arc<dyn Transport>,
    agent_id: String,
    batch_size: usize,
}

impl FlushWorker {
    pub fn new(
        outbox: OutboxManager,
        results: PolicyResultStore,
        transport: Arc<dyn Transport>,
        agent_id: &str,
        batch_size: usize,
    ) -> Self {
        Self {
            outbox,
            results,
            transport,
            agent_id: agent_id.to_string(),
            batch_size,
        }
    }

    pub async fn flush_once(&self) -> Result<FlushReport, SyncError> {
        let records = self
            .outbox
            .fetch_unsent_all(&self.agent_id, self.batch_size)
            .await?;
        let mut report = FlushReport {
            fetched: records.len(),
            ..FlushReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        let batch = UploadBatch {
            agent_id: self.agent_id.clone(),
            records: records.iter().map(WireRecord::from).collect(),
        };
        let acks = self.transport.upload(&batch).await.inspect_err(|e| {
            warn!(
                "[sync] Upload of {} record(s) failed, will retry: {}",
                records.len(),
                e
            )
        })?;

        let mut pending: HashMap<i64, &OutboxRecord> = records.iter().map(|r| (r.id, r)).collect();
        for ack in acks {
            let Some(record) = pending.remove(&ack.record_id) else {
                debug!("[sync] Ignoring ack for record #{} not in this batch", ack.record_id);
                continue;
            };
            if ack.is_retryable() {
                report.retry_later += 1;
                continue;
            }

            match self
                .outbox
                .mark_sent(record.id, ack.status_code, ack.message.as_deref())
                .await?
            {
                MarkSent::Marked => {
                    report.marked += 1;
                    if ack.status_code >= 400 {
                        report.rejected += 1;
                        warn!(
                            "[sync] Server rejected {} record #{} ({}): {}",
                            record.kind,
                            record.id,
                            ack.status_code,
                            ack.message.as_deref().unwrap_or("no reason given")
                        );
                    }
                    if record.kind == OutboxKind::PolicyResult
                        && let Some(exec) = record.execution_id.as_deref()
                    {
                        self.results.mark_reported(exec).await?;
                    }
                }
                MarkSent::AlreadySent | MarkSent::Missing => report.already_sent += 1,
            }
        }
        report.unacked = pending.len();

        info!(
            "[sync] Flushed {} record(s): {} marked, {} rejected, {} retry later, {} unacked",
            report.fetched, report.marked, report.rejected, report.retry_later, report.unacked
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::outbox::OutboxPayload;
    use crate::core::policy::types::PolicyExecutionResult;
    use crate::core::store::RecordStore;
    use crate::core::sync::fake::FakeTransport;
    use crate::core::sync::transport::{RecordAck, TransportError};

    struct Fixture {
        outbox: OutboxManager,
        results: PolicyResultStore,
        transport: Arc<FakeTransport>,
        worker: FlushWorker,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let store = RecordStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let outbox = OutboxManager::new(store.clone(), clock);
        let results = PolicyResultStore::new(store);
        let transport = Arc::new(FakeTransport::default());
        let worker = FlushWorker::new(
            outbox.clone(),
            results.clone(),
            transport.clone(),
            "agent-1",
            batch_size,
        );
        Fixture {
            outbox,
            results,
            transport,
            worker,
        }
    }

    fn ack(record_id: i64, status_code: u16) -> RecordAck {
        RecordAck {
            record_id,
            status_code,
            message: None,
        }
    }

    async fn heartbeat(outbox: &OutboxManager, n: u32) -> i64 {
        outbox
            .append(OutboxKind::Heartbeat, "agent-1", &serde_json::json!({ "n": n }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn acked_records_are_marked_and_unacked_stay_queued() {
        let f = fixture(10);
        let a = heartbeat(&f.outbox, 1).await;
        let b = heartbeat(&f.outbox, 2).await;
        f.transport.answer_upload(Ok(vec![ack(a, 200)]));

        let report = f.worker.flush_once().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.marked, 1);
        assert_eq!(report.unacked, 1);

        let left = f.outbox.fetch_unsent_all("agent-1", 10).await.unwrap();
        assert_eq!(left.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b]);
    }

    #[tokio::test]
    async fn upload_is_fifo_and_kind_tagged() {
        let f = fixture(2);
        let a = heartbeat(&f.outbox, 1).await;
        let b = heartbeat(&f.outbox, 2).await;
        heartbeat(&f.outbox, 3).await;

        f.worker.flush_once().await.unwrap();
        let uploads = f.transport.uploads.lock().unwrap().clone();
        let sent: Vec<i64> = uploads[0].records.iter().map(|r| r.record_id).collect();
        assert_eq!(sent, vec![a, b]);
        assert_eq!(uploads[0].records[0].kind, OutboxKind::Heartbeat);
        assert_eq!(uploads[0].records[0].payload, serde_json::json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn server_errors_leave_records_for_retry() {
        let f = fixture(10);
        let a = heartbeat(&f.outbox, 1).await;
        let b = heartbeat(&f.outbox, 2).await;
        f.transport.answer_upload(Ok(vec![ack(a, 503), ack(b, 422)]));

        let report = f.worker.flush_once().await.unwrap();
        assert_eq!(report.retry_later, 1);
        assert_eq!(report.rejected, 1);

        assert!(!f.outbox.get(a).await.unwrap().unwrap().sent_to_server);
        let rejected = f.outbox.get(b).await.unwrap().unwrap();
        assert!(rejected.sent_to_server);
        assert_eq!(rejected.server_response_code, Some(422));
    }

    #[tokio::test]
    async fn failed_upload_keeps_everything_queued() {
        let f = fixture(10);
        heartbeat(&f.outbox, 1).await;
        f.transport
            .answer_upload(Err(TransportError::Unreachable("offline".to_string())));

        assert!(matches!(
            f.worker.flush_once().await,
            Err(SyncError::Transport(_))
        ));
        assert_eq!(f.outbox.stats().await.unwrap().total_unsent(), 1);
    }

    #[tokio::test]
    async fn duplicate_acks_do_not_change_first_answer() {
        let f = fixture(10);
        let a = heartbeat(&f.outbox, 1).await;
        f.transport
            .answer_upload(Ok(vec![ack(a, 200), ack(a, 201), ack(999, 200)]));

        let report = f.worker.flush_once().await.unwrap();
        assert_eq!(report.marked, 1);
        assert_eq!(
            f.outbox.get(a).await.unwrap().unwrap().server_response_code,
            Some(200)
        );
    }

    #[tokio::test]
    async fn acked_policy_result_is_flagged_reported() {
        let f = fixture(10);
        let mut run = PolicyExecutionResult::start("E1", "agent-1", "p", 0, chrono::Utc::now());
        run.finish(chrono::Utc::now());
        f.results.save(&run).await.unwrap();
        let id = f
            .outbox
            .append_payload("agent-1", &OutboxPayload::PolicyResult(run))
            .await
            .unwrap();
        f.transport.answer_upload(Ok(vec![ack(id, 200)]));

        f.worker.flush_once().await.unwrap();
        assert!(f.results.load("E1").await.unwrap().unwrap().reported_to_server);
    }

    #[tokio::test]
    async fn empty_outbox_skips_upload() {
        let f = fixture(10);
        let report = f.worker.flush_once().await.unwrap();
        assert_eq!(report, FlushReport::default());
        assert!(f.transport.uploads.lock().unwrap().is_empty());
    }
}
