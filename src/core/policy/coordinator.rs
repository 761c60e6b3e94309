use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::PolicyError;
use super::executor::{StepContext, StepExecutor};
use super::results::PolicyResultStore;
use super::types::{
    FinalStatus, PolicyDefinition, PolicyExecutionResult, PolicyStep, PolicyStepResult,
    RawCommand, ScriptExecutionResult,
};
use crate::core::clock::Clock;
use crate::core::inbox::{CommandPayload, InboxCommandRecord, InboxManager, TerminalStatus};
use crate::core::outbox::{OutboxManager, OutboxPayload, OutboxRecord};

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub batch_size: usize,
    pub step_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            step_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Commands whose result was already queued; only the inbox was closed.
    pub recovered: usize,
    /// Commands left pending because the drain was cancelled.
    pub interrupted: usize,
    /// Running results closed as failed because their command was no longer
    /// pending.
    pub abandoned: usize,
    pub errors: usize,
    /// Another drain was already running, nothing was done.
    pub skipped: bool,
}

enum CommandOutcome {
    Finished(FinalStatus),
    Recovered,
    Interrupted,
}

/// Drains pending inbox commands and drives each one to a result record.
pub struct PolicyCoordinator {
    inbox: InboxManager,
    outbox: OutboxManager,
    results: PolicyResultStore,
    executor: Arc<dyn StepExecutor>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    drain_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl PolicyCoordinator {
    pub fn new(
        inbox: InboxManager,
        outbox: OutboxManager,
        results: PolicyResultStore,
        executor: Arc<dyn StepExecutor>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inbox,
            outbox,
            results,
            executor,
            clock,
            config,
            drain_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the current and every later drain.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn results(&self) -> &PolicyResultStore {
        &self.results
    }

    /// Take one batch of pending commands and run each to completion. A
    /// failing command is logged and counted; the rest of the batch still runs.
    pub async fn drain_once(&self) -> Result<DrainReport, PolicyError> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("[policy] Drain already in progress, skipping tick");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        };

        let mut report = DrainReport::default();
        if self.shutdown.is_cancelled() {
            return Ok(report);
        }

        let batch = self.inbox.fetch_pending(self.config.batch_size).await?;
        report.fetched = batch.len();
        report.abandoned = self.close_orphaned_runs().await?;

        for (position, record) in batch.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                report.interrupted += batch.len() - position;
                break;
            }
            match self.run_command(record).await {
                Ok(CommandOutcome::Finished(FinalStatus::Success)) => report.succeeded += 1,
                Ok(CommandOutcome::Finished(FinalStatus::Failed)) => report.failed += 1,
                Ok(CommandOutcome::Recovered) => report.recovered += 1,
                Ok(CommandOutcome::Interrupted) => report.interrupted += 1,
                Err(e) => {
                    error!(
                        "[policy] Command {} could not be processed: {}",
                        record.execution_id, e
                    );
                    report.errors += 1;
                }
            }
        }

        if report.fetched > 0 || report.abandoned > 0 {
            info!(
                "[policy] Drain finished: {} fetched, {} succeeded, {} failed, {} recovered, {} interrupted, {} abandoned, {} error(s)",
                report.fetched,
                report.succeeded,
                report.failed,
                report.recovered,
                report.interrupted,
                report.abandoned,
                report.errors
            );
        }
        Ok(report)
    }

    /// Finish every `running` result whose command is no longer pending, so
    /// nothing will resume it. Each is queued for upload and saved as failed.
    /// Must hold the drain lock.
    async fn close_orphaned_runs(&self) -> Result<usize, PolicyError> {
        let mut closed = 0;
        for mut run in self.results.list_running().await? {
            let reason = match self.inbox.get(&run.execution_id).await? {
                Some(command) if !command.status.is_terminal() => continue,
                Some(command) => format!("command {} before the policy finished", command.status),
                None => "command was purged before the policy finished".to_string(),
            };

            run.abandon(&reason, self.clock.now());
            if self
                .outbox
                .find_by_execution_id(&run.execution_id)
                .await?
                .is_none()
            {
                self.outbox
                    .append_payload(&run.agent_id, &OutboxPayload::PolicyResult(run.clone()))
                    .await?;
            }
            self.results.save(&run).await?;
            warn!(
                "[policy] Closed orphaned run {} after {}/{} step(s): {}",
                run.execution_id, run.completed_steps, run.total_steps, reason
            );
            closed += 1;
        }
        Ok(closed)
    }

    async fn run_command(&self, record: &InboxCommandRecord) -> Result<CommandOutcome, PolicyError> {
        if let Some(existing) = self
            .outbox
            .find_by_execution_id(&record.execution_id)
            .await?
        {
            self.close_from_existing(record, &existing).await?;
            return Ok(CommandOutcome::Recovered);
        }

        match &record.payload {
            CommandPayload::Command(raw) => self.run_script(record, raw).await,
            CommandPayload::Policy(definition) => self.run_policy(record, definition).await,
        }
    }

    /// The result was queued before a crash; only the inbox transition is
    /// missing.
    async fn close_from_existing(
        &self,
        record: &InboxCommandRecord,
        existing: &OutboxRecord,
    ) -> Result<(), PolicyError> {
        let (status, message) = match existing.decode() {
            Ok(OutboxPayload::PolicyResult(result)) => match result.final_status {
                Some(FinalStatus::Success) => (TerminalStatus::Completed, None),
                _ => (TerminalStatus::Failed, result.error_summary),
            },
            Ok(OutboxPayload::ScriptExecution(script)) if script.success => {
                (TerminalStatus::Completed, None)
            }
            Ok(OutboxPayload::ScriptExecution(script)) => (TerminalStatus::Failed, script.error),
            Ok(other) => (
                TerminalStatus::Failed,
                Some(format!("unexpected {} record for execution", other.kind())),
            ),
            Err(e) => (
                TerminalStatus::Failed,
                Some(format!("queued result unreadable: {}", e)),
            ),
        };

        info!(
            "[policy] Result for {} already queued as #{}, closing without re-running",
            record.execution_id, existing.id
        );
        self.inbox
            .mark_terminal(&record.execution_id, status, message.as_deref())
            .await?;
        Ok(())
    }

    async fn run_script(
        &self,
        record: &InboxCommandRecord,
        raw: &RawCommand,
    ) -> Result<CommandOutcome, PolicyError> {
        let step = raw.as_step();
        let ctx = StepContext {
            execution_id: record.execution_id.clone(),
            agent_id: record.agent_id.clone(),
            step_index: 0,
        };

        let Some(run) = self.execute_step(&ctx, &step).await else {
            info!(
                "[policy] Command {} interrupted, left pending",
                record.execution_id
            );
            return Ok(CommandOutcome::Interrupted);
        };

        let result = ScriptExecutionResult {
            execution_id: record.execution_id.clone(),
            command: raw.command.clone(),
            success: run.step.success,
            exit_code: run.exit_code,
            output: run.step.output,
            error: run.step.error,
            duration_ms: run.step.duration_ms,
            started_at: run.step.started_at,
            completed_at: self.clock.now(),
        };
        let final_status = if result.success {
            FinalStatus::Success
        } else {
            FinalStatus::Failed
        };
        let message = result.error.clone();
        self.finalize(
            record,
            OutboxPayload::ScriptExecution(result),
            final_status,
            message,
        )
        .await?;
        Ok(CommandOutcome::Finished(final_status))
    }

    async fn run_policy(
        &self,
        record: &InboxCommandRecord,
        definition: &PolicyDefinition,
    ) -> Result<CommandOutcome, PolicyError> {
        let total_steps = u32::try_from(definition.steps.len())
            .map_err(|_| PolicyError::TooManySteps(definition.steps.len()))?;

        let mut run = match self.results.load(&record.execution_id).await? {
            Some(mut run) => {
                if run.total_steps != total_steps {
                    return Err(PolicyError::DefinitionMismatch {
                        execution_id: record.execution_id.clone(),
                        recorded: run.total_steps,
                        defined: definition.steps.len(),
                    });
                }
                if !run.is_finished() {
                    run.retry_count += 1;
                    info!(
                        "[policy] Resuming {} at step {}/{} (retry {})",
                        run.execution_id,
                        run.completed_steps + 1,
                        run.total_steps,
                        run.retry_count
                    );
                    self.results.save(&run).await?;
                }
                run
            }
            None => {
                let run = PolicyExecutionResult::start(
                    &record.execution_id,
                    &record.agent_id,
                    &definition.policy_id,
                    total_steps,
                    self.clock.now(),
                );
                info!(
                    "[policy] Starting {} ({} step(s)) for {}",
                    definition.policy_id, total_steps, record.execution_id
                );
                self.results.save(&run).await?;
                run
            }
        };

        if !run.is_finished() {
            if !self.advance(&mut run, definition).await? {
                info!(
                    "[policy] {} interrupted after {}/{} step(s)",
                    run.execution_id, run.completed_steps, run.total_steps
                );
                return Ok(CommandOutcome::Interrupted);
            }
            run.finish(self.clock.now());
            self.results.save(&run).await?;
        }

        let final_status = run.final_status.unwrap_or(FinalStatus::Failed);
        let message = run.error_summary.clone();
        self.finalize(record, OutboxPayload::PolicyResult(run), final_status, message)
            .await?;
        Ok(CommandOutcome::Finished(final_status))
    }

    /// Run the remaining steps, saving after each. Returns `false` when
    /// cancelled before the policy could finish.
    async fn advance(
        &self,
        run: &mut PolicyExecutionResult,
        definition: &PolicyDefinition,
    ) -> Result<bool, PolicyError> {
        if aborted_on_last_step(run, definition) {
            return Ok(true);
        }

        while run.completed_steps < run.total_steps {
            if self.shutdown.is_cancelled() {
                return Ok(false);
            }
            let index = run.current_step;
            let step = &definition.steps[index as usize];
            let ctx = StepContext {
                execution_id: run.execution_id.clone(),
                agent_id: run.agent_id.clone(),
                step_index: index,
            };

            let Some(outcome) = self.execute_step(&ctx, step).await else {
                return Ok(false);
            };
            let failed = !outcome.step.success;
            run.record_step(outcome.step)?;
            self.results.save(run).await?;

            if failed {
                if step.continue_on_error {
                    warn!(
                        "[policy] Step {} [{}] of {} failed, continuing",
                        index + 1,
                        step.name,
                        run.execution_id
                    );
                } else {
                    warn!(
                        "[policy] Step {} [{}] of {} failed, aborting policy",
                        index + 1,
                        step.name,
                        run.execution_id
                    );
                    break;
                }
            }
        }
        Ok(true)
    }

    /// Run one step under its timeout. `None` means the drain was cancelled
    /// while the step ran; nothing is recorded for it.
    async fn execute_step(&self, ctx: &StepContext, step: &PolicyStep) -> Option<StepRun> {
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.step_timeout);
        let started_at = self.clock.now();
        let start = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return None,
            res = tokio::time::timeout(timeout, self.executor.execute(ctx, step)) => res,
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let (success, exit_code, output, error) = match outcome {
            Ok(Ok(out)) => {
                let success = out.success();
                let error = (!success).then(|| {
                    let detail = out.stderr.trim();
                    match out.exit_code {
                        Some(code) if detail.is_empty() => format!("exited with status {}", code),
                        Some(code) => format!("exited with status {}: {}", code, detail),
                        None if detail.is_empty() => "terminated by signal".to_string(),
                        None => format!("terminated by signal: {}", detail),
                    }
                });
                (success, out.exit_code, out.stdout, error)
            }
            Ok(Err(e)) => (false, None, String::new(), Some(e.to_string())),
            Err(_) => (
                false,
                None,
                String::new(),
                Some(format!("timed out after {:?}", timeout)),
            ),
        };

        Some(StepRun {
            exit_code,
            step: PolicyStepResult {
                step_index: ctx.step_index,
                name: step.name.clone(),
                success,
                output,
                error,
                duration_ms,
                started_at,
            },
        })
    }

    /// Queue the result then close the inbox command. The two writes are not
    /// atomic; a crash in between is repaired by the execution-id lookup in
    /// [`run_command`](Self::run_command).
    async fn finalize(
        &self,
        record: &InboxCommandRecord,
        payload: OutboxPayload,
        final_status: FinalStatus,
        message: Option<String>,
    ) -> Result<(), PolicyError> {
        let id = self.outbox.append_payload(&record.agent_id, &payload).await?;
        let status = match final_status {
            FinalStatus::Success => TerminalStatus::Completed,
            FinalStatus::Failed => TerminalStatus::Failed,
        };
        self.inbox
            .mark_terminal(&record.execution_id, status, message.as_deref())
            .await?;
        info!(
            "[policy] {} finished {} (result #{})",
            record.execution_id,
            final_status.as_str(),
            id
        );
        Ok(())
    }
}

struct StepRun {
    exit_code: Option<i32>,
    step: PolicyStepResult,
}

/// A run interrupted right after persisting a failed step that does not
/// allow continuation must not go on to the next step.
fn aborted_on_last_step(run: &PolicyExecutionResult, definition: &PolicyDefinition) -> bool {
    run.step_results.last().is_some_and(|last| {
        !last.success
            && definition
                .steps
                .get(last.step_index as usize)
                .is_some_and(|step| !step.continue_on_error)
    })
}

#[async_trait::async_trait]
impl crate::core::lifecycle::LifecycleComponent for PolicyCoordinator {
    async fn on_shutdown(&self) -> anyhow::Result<()> {
        info!("[policy] Cancelling in-flight policy execution");
        self.shutdown.cancel();
        Ok(())
    }
}
