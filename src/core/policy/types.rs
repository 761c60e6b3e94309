use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PolicyError;

/// One entry of a server-issued policy. Steps run strictly in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStep {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub policy_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<PolicyStep>,
}

/// A flat one-shot command, run as a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl RawCommand {
    pub fn as_step(&self) -> PolicyStep {
        PolicyStep {
            name: self.command.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            continue_on_error: false,
            timeout_secs: self.timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Success,
    Failed,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalStatus::Success => "success",
            FinalStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "success" => Some(FinalStatus::Success),
            "failed" => Some(FinalStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStepResult {
    pub step_index: u32,
    pub name: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

/// Durable progress of one policy run, keyed by the command's execution id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyExecutionResult {
    pub execution_id: String,
    pub agent_id: String,
    pub policy_id: String,
    pub status: ExecutionStatus,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub current_step: u32,
    pub step_results: Vec<PolicyStepResult>,
    pub final_status: Option<FinalStatus>,
    pub error_summary: Option<String>,
    pub total_execution_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub reported_to_server: bool,
}

impl PolicyExecutionResult {
    pub fn start(
        execution_id: &str,
        agent_id: &str,
        policy_id: &str,
        total_steps: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            agent_id: agent_id.to_string(),
            policy_id: policy_id.to_string(),
            status: ExecutionStatus::Running,
            total_steps,
            completed_steps: 0,
            current_step: 0,
            step_results: Vec::new(),
            final_status: None,
            error_summary: None,
            total_execution_time_ms: 0,
            started_at,
            completed_at: None,
            retry_count: 0,
            reported_to_server: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Append the outcome of the step at `current_step` and advance.
    pub fn record_step(&mut self, result: PolicyStepResult) -> Result<(), PolicyError> {
        if self.is_finished() {
            return Err(PolicyError::AlreadyFinished(self.execution_id.clone()));
        }
        if self.completed_steps >= self.total_steps {
            return Err(PolicyError::StepOverflow {
                execution_id: self.execution_id.clone(),
                total_steps: self.total_steps,
            });
        }
        if result.step_index != self.current_step {
            return Err(PolicyError::OutOfOrderStep {
                execution_id: self.execution_id.clone(),
                expected: self.current_step,
                got: result.step_index,
            });
        }
        self.total_execution_time_ms = self
            .total_execution_time_ms
            .saturating_add(result.duration_ms);
        self.step_results.push(result);
        self.completed_steps += 1;
        self.current_step = self.completed_steps;
        Ok(())
    }

    /// Close the run. The final status is derived from the recorded steps.
    pub fn finish(&mut self, completed_at: DateTime<Utc>) {
        let failures: Vec<String> = self
            .step_results
            .iter()
            .filter(|r| !r.success)
            .map(|r| {
                format!(
                    "step {} ({}): {}",
                    r.step_index + 1,
                    r.name,
                    r.error.as_deref().unwrap_or("failed")
                )
            })
            .collect();

        if failures.is_empty() {
            self.final_status = Some(FinalStatus::Success);
            self.error_summary = None;
        } else {
            self.final_status = Some(FinalStatus::Failed);
            self.error_summary = Some(failures.join("; "));
        }
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(completed_at);
    }

    /// Close a run that can no longer make progress. It always ends failed,
    /// with `reason` ahead of any step failures.
    pub fn abandon(&mut self, reason: &str, completed_at: DateTime<Utc>) {
        self.finish(completed_at);
        self.final_status = Some(FinalStatus::Failed);
        self.error_summary = Some(match self.error_summary.take() {
            Some(steps) => format!("{}; {}", reason, steps),
            None => reason.to_string(),
        });
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.completed_steps > self.total_steps {
            return Err(format!(
                "completed_steps {} exceeds total_steps {}",
                self.completed_steps, self.total_steps
            ));
        }
        if self.step_results.len() != self.completed_steps as usize {
            return Err(format!(
                "{} step result(s) recorded but completed_steps is {}",
                self.step_results.len(),
                self.completed_steps
            ));
        }
        if self.is_finished() != self.final_status.is_some() {
            return Err("final_status must be set exactly when completed".to_string());
        }
        Ok(())
    }
}

/// Outcome of a flat command, uploaded as a script-execution record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptExecutionResult {
    pub execution_id: String,
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: u32, success: bool) -> PolicyStepResult {
        PolicyStepResult {
            step_index: index,
            name: format!("s{}", index),
            success,
            output: String::new(),
            error: (!success).then(|| "boom".to_string()),
            duration_ms: 10,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn record_step_advances_counters_together() {
        let mut run = PolicyExecutionResult::start("e1", "a", "p", 2, Utc::now());
        run.record_step(step(0, true)).unwrap();
        assert_eq!(run.completed_steps, 1);
        assert_eq!(run.current_step, 1);
        assert_eq!(run.step_results.len(), 1);
        assert_eq!(run.total_execution_time_ms, 10);
        run.check_invariants().unwrap();
    }

    #[test]
    fn record_step_rejects_overflow() {
        let mut run = PolicyExecutionResult::start("e1", "a", "p", 1, Utc::now());
        run.record_step(step(0, true)).unwrap();
        let err = run.record_step(step(1, true)).unwrap_err();
        assert!(matches!(err, PolicyError::StepOverflow { .. }));
        assert_eq!(run.step_results.len(), 1);
    }

    #[test]
    fn record_step_rejects_skipped_index() {
        let mut run = PolicyExecutionResult::start("e1", "a", "p", 3, Utc::now());
        let err = run.record_step(step(1, true)).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::OutOfOrderStep {
                expected: 0,
                got: 1,
                ..
            }
        ));
    }

    #[test]
    fn finish_summarizes_failures() {
        let mut run = PolicyExecutionResult::start("e1", "a", "p", 3, Utc::now());
        run.record_step(step(0, true)).unwrap();
        run.record_step(step(1, false)).unwrap();
        run.finish(Utc::now());

        assert_eq!(run.final_status, Some(FinalStatus::Failed));
        assert_eq!(run.error_summary.as_deref(), Some("step 2 (s1): boom"));
        assert_eq!(run.status, ExecutionStatus::Completed);
        run.check_invariants().unwrap();
        assert!(run.record_step(step(2, true)).is_err());
    }

    #[test]
    fn abandon_fails_even_without_step_failures() {
        let mut run = PolicyExecutionResult::start("e1", "a", "p", 3, Utc::now());
        run.record_step(step(0, true)).unwrap();
        run.abandon("command expired before the policy finished", Utc::now());

        assert_eq!(run.final_status, Some(FinalStatus::Failed));
        assert_eq!(
            run.error_summary.as_deref(),
            Some("command expired before the policy finished")
        );
        assert_eq!(run.completed_steps, 1);
        run.check_invariants().unwrap();

        let mut run = PolicyExecutionResult::start("e2", "a", "p", 2, Utc::now());
        run.record_step(step(0, false)).unwrap();
        run.abandon("gone", Utc::now());
        assert_eq!(run.error_summary.as_deref(), Some("gone; step 1 (s0): boom"));
    }

    #[test]
    fn running_record_has_no_final_status() {
        let run = PolicyExecutionResult::start("e1", "a", "p", 0, Utc::now());
        assert!(run.final_status.is_none());
        run.check_invariants().unwrap();
    }

    #[test]
    fn step_defaults_from_json() {
        let step: PolicyStep =
            serde_json::from_str(r#"{"name":"update","command":"apt-get"}"#).unwrap();
        assert!(step.args.is_empty());
        assert!(!step.continue_on_error);
        assert!(step.timeout_secs.is_none());
    }
}
