use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::executor::{StepContext, StepExecutor, StepOutput};
use super::results::PolicyResultStore;
use super::types::{PolicyDefinition, PolicyStep, RawCommand};
use super::{CoordinatorConfig, PolicyCoordinator};
use crate::core::clock::ManualClock;
use crate::core::inbox::{CommandPayload, InboxManager, IncomingCommand};
use crate::core::outbox::OutboxManager;
use crate::core::store::RecordStore;


/// What the fake executor does when it meets a given command.
#[derive(Clone)]
pub(super) enum Behavior {
    Succeed(&'static str),
    Exit(i32, &'static str),
    SpawnError(&'static str),
    Hang,
    /// Cancel the armed token, then never finish.
    CancelDrain,
    /// Signal `started`, then succeed once `release` is notified.
    Gate {
        started: Arc<Notify>,
        release: Arc<Notify>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Observation {
    pub execution_id: String,
    pub step_index: u32,
    pub completed_steps: Option<u32>,
    pub step_results: Option<usize>,
}

pub(super) struct ScriptedExecutor {
    behaviors: HashMap<String, Behavior>,
    inspector: Option<PolicyResultStore>,
    cancel: StdMutex<Option<CancellationToken>>,
    calls: StdMutex<Vec<Observation>>,
}

impl ScriptedExecutor {
    pub fn new(behaviors: &[(&str, Behavior)]) -> Self {
        Self {
            behaviors: behaviors
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            inspector: None,
            cancel: StdMutex::new(None),
            calls: StdMutex::new(Vec::new()),
        }
    }

    /// Read the persisted result record every time a step starts.
    pub fn with_inspector(mut self, results: PolicyResultStore) -> Self {
        self.inspector = Some(results);
        self
    }

    pub fn arm_cancel(&self, token: CancellationToken) {
        *self.cancel.lock().unwrap() = Some(token);
    }

    pub fn calls(&self) -> Vec<Observation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn step_indexes(&self) -> Vec<u32> {
        self.calls().iter().map(|c| c.step_index).collect()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: &StepContext, step: &PolicyStep) -> Result<StepOutput> {
        let persisted = match &self.inspector {
            Some(results) => {
                let record = results.load(&ctx.execution_id).await?;
                if let Some(r) = &record {
                    r.check_invariants().map_err(|e| anyhow::anyhow!(e))?;
                }
                record
            }
            None => None,
        };
        self.calls.lock().unwrap().push(Observation {
            execution_id: ctx.execution_id.clone(),
            step_index: ctx.step_index,
            completed_steps: persisted.as_ref().map(|r| r.completed_steps),
            step_results: persisted.as_ref().map(|r| r.step_results.len()),
        });

        match self
            .behaviors
            .get(&step.command)
            .cloned()
            .unwrap_or(Behavior::Succeed("ok"))
        {
            Behavior::Succeed(out) => Ok(StepOutput::succeeded(out)),
            Behavior::Exit(code, err) => Ok(StepOutput::failed(code, err)),
            Behavior::SpawnError(msg) => Err(anyhow::anyhow!(msg)),
            Behavior::Hang => std::future::pending().await,
            Behavior::CancelDrain => {
                let token = self.cancel.lock().unwrap().clone();
                if let Some(token) = token {
                    token.cancel();
                }
                std::future::pending().await
            }
            Behavior::Gate { started, release } => {
                started.notify_one();
                release.notified().await;
                Ok(StepOutput::succeeded("released"))
            }
        }
    }
}

pub(super) struct Harness {
    pub store: RecordStore,
    pub clock: Arc<ManualClock>,
    pub inbox: InboxManager,
    pub outbox: OutboxManager,
    pub results: PolicyResultStore,
    pub executor: Arc<ScriptedExecutor>,
    pub coordinator: PolicyCoordinator,
}

impl Harness {
    pub fn new(behaviors: &[(&str, Behavior)]) -> Self {
        Self::build(RecordStore::open_in_memory().unwrap(), behaviors, false, None)
    }

    pub fn inspected(behaviors: &[(&str, Behavior)]) -> Self {
        Self::build(RecordStore::open_in_memory().unwrap(), behaviors, true, None)
    }

    pub fn with_step_timeout(behaviors: &[(&str, Behavior)], timeout: Duration) -> Self {
        Self::build(
            RecordStore::open_in_memory().unwrap(),
            behaviors,
            false,
            Some(timeout),
        )
    }

    pub fn on_store(store: RecordStore, behaviors: &[(&str, Behavior)]) -> Self {
        Self::build(store, behaviors, false, None)
    }

    fn build(
        store: RecordStore,
        behaviors: &[(&str, Behavior)],
        inspect: bool,
        step_timeout: Option<Duration>,
    ) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let inbox = InboxManager::new(store.clone(), clock.clone(), chrono::Duration::hours(1));
        let outbox = OutboxManager::new(store.clone(), clock.clone());
        let results = PolicyResultStore::new(store.clone());

        let mut executor = ScriptedExecutor::new(behaviors);
        if inspect {
            executor = executor.with_inspector(results.clone());
        }
        let executor = Arc::new(executor);

        let mut config = CoordinatorConfig::default();
        if let Some(timeout) = step_timeout {
            config.step_timeout = timeout;
        }
        let coordinator = PolicyCoordinator::new(
            inbox.clone(),
            outbox.clone(),
            results.clone(),
            executor.clone(),
            clock.clone(),
            config,
        );
        executor.arm_cancel(coordinator.cancel_token());

        Self {
            store,
            clock,
            inbox,
            outbox,
            results,
            executor,
            coordinator,
        }
    }

    pub async fn submit_policy(&self, execution_id: &str, steps: Vec<PolicyStep>) {
        self.submit(
            execution_id,
            CommandPayload::Policy(PolicyDefinition {
                policy_id: "baseline".to_string(),
                name: None,
                steps,
            }),
        )
        .await;
    }

    pub async fn submit_command(&self, execution_id: &str, command: &str) {
        self.submit(
            execution_id,
            CommandPayload::Command(RawCommand {
                command: command.to_string(),
                args: Vec::new(),
                env: Default::default(),
                timeout_secs: None,
            }),
        )
        .await;
    }

    async fn submit(&self, execution_id: &str, payload: CommandPayload) {
        self.inbox
            .accept(&IncomingCommand {
                execution_id: execution_id.to_string(),
                agent_id: "agent-1".to_string(),
                issued_at: None,
                expires_at: None,
                ttl_seconds: None,
                payload,
            })
            .await
            .unwrap();
    }
}

pub(super) fn step(command: &str) -> PolicyStep {
    PolicyStep {
        name: command.to_string(),
        command: command.to_string(),
        args: Vec::new(),
        env: Default::default(),
        continue_on_error: false,
        timeout_secs: None,
    }
}

pub(super) fn lenient(command: &str) -> PolicyStep {
    PolicyStep {
        continue_on_error: true,
        ..step(command)
    }
}
