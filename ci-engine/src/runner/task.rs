//! Retry and timeout wrapper around a single step process.

use super::{resolve_command, CommandSpec, EntrypointResolver, OutputSink, ProcessLauncher};
use crate::cancellation::CancellationToken;
use crate::core::{ExecutionPolicy, StageOutput, StepKind, UnitStep};
use crate::errors::EngineError;
use crate::observability::SpanTimer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The process exited successfully.
    Succeeded,
    /// The attempt exceeded its deadline.
    TimedOut,
    /// The process failed, could not start, or was cancelled.
    Failed,
}

/// Observability record of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// The step the attempt belongs to.
    pub step_id: String,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Error message for unsuccessful attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of running a step task.
#[derive(Debug)]
pub struct TaskOutcome {
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
    /// Success, or the error of the final attempt.
    pub result: Result<(), EngineError>,
    /// One record per attempt started.
    pub records: Vec<AttemptRecord>,
}

impl TaskOutcome {
    /// Returns true if the task succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Converts into the attempt count or the final error.
    pub fn into_result(self) -> Result<u32, EngineError> {
        self.result.map(|()| self.attempts)
    }
}

/// Runs one unit step's command with a per-attempt deadline and a bounded
/// number of attempts.
///
/// The command is resolved once before the first attempt. Resolution
/// failures, empty commands and cancellation end the task immediately since
/// another attempt cannot change their outcome; timeouts and process
/// failures are retried until the attempt budget is spent.
pub struct StepTask {
    step_id: String,
    display_name: String,
    kind: StepKind,
    policy: ExecutionPolicy,
    outputs: StageOutput,
    extra_env: HashMap<String, String>,
    resolver: Arc<dyn EntrypointResolver>,
    launcher: Arc<dyn ProcessLauncher>,
    sink: Arc<dyn OutputSink>,
}

impl StepTask {
    /// Creates a task for a unit step.
    #[must_use]
    pub fn new(
        step: &UnitStep,
        policy: ExecutionPolicy,
        resolver: Arc<dyn EntrypointResolver>,
        launcher: Arc<dyn ProcessLauncher>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            step_id: step.id.clone(),
            display_name: step.display_name.clone(),
            kind: step.kind.clone(),
            policy,
            outputs: StageOutput::new(),
            extra_env: HashMap::new(),
            resolver,
            launcher,
            sink,
        }
    }

    /// Sets the outputs of earlier steps used for interpolation.
    #[must_use]
    pub fn with_outputs(mut self, outputs: StageOutput) -> Self {
        self.outputs = outputs;
        self
    }

    /// Adds an environment variable set by the engine itself.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    /// Returns the resolved policy.
    #[must_use]
    pub fn policy(&self) -> ExecutionPolicy {
        self.policy
    }

    /// Runs the task until it succeeds or its attempt budget is spent.
    pub async fn run(&self, token: &Arc<CancellationToken>) -> TaskOutcome {
        let mut records = Vec::new();
        let started_at = Utc::now();
        let timer = SpanTimer::start(&self.step_id);

        let command = match self.resolve().await {
            Ok(command) => command,
            Err(err) => {
                error!(
                    step_id = %self.step_id,
                    retry_count = 1,
                    elapsed_time_ms = timer.elapsed_ms(),
                    error = %err,
                    "failed to resolve command for step"
                );
                records.push(AttemptRecord {
                    step_id: self.step_id.clone(),
                    attempt: 1,
                    started_at,
                    elapsed_ms: timer.elapsed_ms(),
                    outcome: AttemptOutcome::Failed,
                    error: Some(err.to_string()),
                });
                return TaskOutcome {
                    attempts: 1,
                    result: Err(err),
                    records,
                };
            }
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let (record, result) = self.execute(&command, attempt, token).await;
            records.push(record);

            match result {
                Ok(()) => {
                    return TaskOutcome {
                        attempts: attempt,
                        result: Ok(()),
                        records,
                    };
                }
                Err(err) if err.is_fatal() || attempt >= max_attempts => {
                    return TaskOutcome {
                        attempts: attempt,
                        result: Err(err),
                        records,
                    };
                }
                Err(_) => attempt += 1,
            }
        }
    }

    async fn resolve(&self) -> Result<CommandSpec, EngineError> {
        let mut command =
            resolve_command(&self.step_id, &self.kind, self.resolver.as_ref(), &self.outputs).await?;
        command
            .env
            .extend(self.extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(command)
    }

    async fn execute(
        &self,
        command: &CommandSpec,
        attempt: u32,
        token: &Arc<CancellationToken>,
    ) -> (AttemptRecord, Result<(), EngineError>) {
        let started_at = Utc::now();
        let timer = SpanTimer::start(&self.step_id);
        let attempt_token = token.child_token();

        let launch = self.launcher.launch(
            &self.step_id,
            command,
            self.sink.clone(),
            attempt_token.clone(),
        );

        let result = tokio::select! {
            exit = launch => match exit {
                Ok(exit) if exit.is_success() => Ok(()),
                Ok(exit) => Err(EngineError::execution(
                    &self.step_id,
                    attempt,
                    exit.code,
                    exit.code.map_or_else(
                        || "process terminated by signal".to_string(),
                        |code| format!("exit status {code}"),
                    ),
                )),
                Err(e) if token.is_cancelled() => Err(EngineError::cancelled(
                    &self.step_id,
                    token.reason().unwrap_or_else(|| e.to_string()),
                )),
                Err(e) => Err(EngineError::execution(&self.step_id, attempt, None, e.to_string())),
            },
            () = tokio::time::sleep(self.policy.timeout()) => {
                attempt_token.cancel("attempt deadline exceeded");
                Err(EngineError::timeout(&self.step_id, attempt, self.policy.timeout_secs))
            },
            () = token.cancelled() => Err(EngineError::cancelled(
                &self.step_id,
                token.reason().unwrap_or_default(),
            )),
        };

        let elapsed_ms = timer.elapsed_ms();
        let outcome = match &result {
            Ok(()) => {
                info!(
                    step_id = %self.step_id,
                    display_name = %self.display_name,
                    arguments = ?command.argv,
                    retry_count = attempt,
                    elapsed_time_ms = elapsed_ms,
                    "Successfully executed step"
                );
                AttemptOutcome::Succeeded
            }
            Err(err) => {
                let message = if err.is_timeout() {
                    "timeout while executing step"
                } else {
                    "error encountered while executing step"
                };
                error!(
                    step_id = %self.step_id,
                    commands = ?command.argv,
                    retry_count = attempt,
                    max_attempts = self.policy.max_attempts,
                    elapsed_time_ms = elapsed_ms,
                    error = %err,
                    "{}", message
                );
                if err.is_timeout() {
                    AttemptOutcome::TimedOut
                } else {
                    AttemptOutcome::Failed
                }
            }
        };

        let record = AttemptRecord {
            step_id: self.step_id.clone(),
            attempt,
            started_at,
            elapsed_ms,
            outcome,
            error: result.as_ref().err().map(ToString::to_string),
        };
        (record, result)
    }
}

impl std::fmt::Debug for StepTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepTask")
            .field("step_id", &self.step_id)
            .field("kind", &self.kind.name())
            .field("policy", &self.policy)
            .finish()
    }
}
