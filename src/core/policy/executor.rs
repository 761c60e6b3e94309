use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::types::PolicyStep;
use crate::platform::{NativePlatform, Platform};

/// Identity of the step being run, passed through to the executor.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: String,
    pub agent_id: String,
    pub step_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one step. An `Err` means the step could not be started at all; a
/// non-zero exit is reported through [`StepOutput`].
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepContext, step: &PolicyStep) -> Result<StepOutput>;
}

/// Runs steps as host processes. A step without arguments is handed to the
/// platform shell so inline scripts work; otherwise the program is spawned
/// directly with its argument vector.
pub struct ShellStepExecutor;

#[async_trait]
impl StepExecutor for ShellStepExecutor {
    async fn execute(&self, ctx: &StepContext, step: &PolicyStep) -> Result<StepOutput> {
        info!(
            "[policy] Running step {} [{}] of {}",
            ctx.step_index + 1,
            step.name,
            ctx.execution_id
        );

        let mut cmd = if step.args.is_empty() {
            NativePlatform::shell_inline(&step.command)
        } else {
            let mut cmd = tokio::process::Command::new(&step.command);
            cmd.args(&step.args);
            cmd
        };
        cmd.envs(&step.env);
        cmd.env("OUTPOST_EXECUTION_ID", &ctx.execution_id);
        cmd.env("OUTPOST_AGENT_ID", &ctx.agent_id);
        cmd.env("OUTPOST_STEP_INDEX", ctx.step_index.to_string());
        cmd.stdin(std::process::Stdio::null());
        // A timed-out or cancelled step drops the future; take the child with it.
        cmd.kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start '{}': {}", step.command, e))?;

        Ok(StepOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
