//! Test doubles for launchers and unit executors.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::core::{StageOutput, StepOutput, UnitStep};
use crate::errors::EngineError;
use crate::executor::UnitExecutor;
use crate::runner::{CommandSpec, OutputSink, ProcessExit, ProcessLauncher};

/// A launcher that replays scripted exit codes and delays instead of
/// starting processes.
///
/// Each launch consumes the next scripted exit code and delay; once a script
/// is exhausted the defaults apply (exit 0, no delay). Every launch writes a
/// `launch <n>: <argv>` line to the sink, followed by `exit <code>` if it
/// runs to completion.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    exits: Mutex<VecDeque<i32>>,
    delays: Mutex<VecDeque<Duration>>,
    default_exit: i32,
    default_delay: Duration,
    launches: Mutex<Vec<CommandSpec>>,
}

impl ScriptedLauncher {
    /// Creates a launcher whose processes all succeed immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the exit code used once the script is exhausted.
    #[must_use]
    pub fn with_default_exit(mut self, code: i32) -> Self {
        self.default_exit = code;
        self
    }

    /// Appends exit codes to the script.
    #[must_use]
    pub fn with_exits(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.exits.get_mut().extend(codes);
        self
    }

    /// Sets the delay used once the delay script is exhausted.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Appends per-launch delays to the script.
    #[must_use]
    pub fn with_delays(mut self, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.delays.get_mut().extend(delays);
        self
    }

    /// Returns the number of launches so far.
    #[must_use]
    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    /// Returns the most recently launched command.
    #[must_use]
    pub fn last_command(&self) -> Option<CommandSpec> {
        self.launches.lock().last().cloned()
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        step_id: &str,
        command: &CommandSpec,
        sink: Arc<dyn OutputSink>,
        token: Arc<CancellationToken>,
    ) -> std::io::Result<ProcessExit> {
        let launch = {
            let mut launches = self.launches.lock();
            launches.push(command.clone());
            launches.len()
        };
        let delay = self.delays.lock().pop_front().unwrap_or(self.default_delay);
        let code = self.exits.lock().pop_front().unwrap_or(self.default_exit);

        sink.write_line(step_id, &format!("launch {launch}: {}", command.argv.join(" ")));

        if !delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = token.cancelled() => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        token.reason().unwrap_or_default(),
                    ));
                }
            }
        }

        sink.write_line(step_id, &format!("exit {code}"));
        Ok(ProcessExit::with_code(code))
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Exit(i32),
    Timeout,
}

#[derive(Debug, Clone, Default)]
struct Behavior {
    output: StepOutput,
    failure: Option<Failure>,
    delay: Duration,
    cleanup_fails: bool,
    cleanup_delay: Duration,
}

/// A unit executor that records every call and returns scripted results.
///
/// Steps without a script succeed with an empty output.
#[derive(Debug, Default)]
pub struct RecordingUnitExecutor {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<String>>,
    observed: Mutex<HashMap<String, StageOutput>>,
}

impl RecordingUnitExecutor {
    /// Creates an executor where every step succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn behavior(&mut self, step_id: &str) -> &mut Behavior {
        self.behaviors.entry(step_id.to_string()).or_default()
    }

    /// Makes a step succeed with the given output.
    #[must_use]
    pub fn succeed(mut self, step_id: &str, output: StepOutput) -> Self {
        let behavior = self.behavior(step_id);
        behavior.output = output;
        behavior.failure = None;
        self
    }

    /// Makes a step fail with the given exit code.
    #[must_use]
    pub fn fail(mut self, step_id: &str, exit_code: i32) -> Self {
        self.behavior(step_id).failure = Some(Failure::Exit(exit_code));
        self
    }

    /// Makes a step fail with a timeout.
    #[must_use]
    pub fn time_out(mut self, step_id: &str) -> Self {
        self.behavior(step_id).failure = Some(Failure::Timeout);
        self
    }

    /// Delays a step's body.
    #[must_use]
    pub fn with_delay(mut self, step_id: &str, delay: Duration) -> Self {
        self.behavior(step_id).delay = delay;
        self
    }

    /// Makes a step's cleanup fail.
    #[must_use]
    pub fn fail_cleanup(mut self, step_id: &str) -> Self {
        self.behavior(step_id).cleanup_fails = true;
        self
    }

    /// Delays a step's cleanup.
    #[must_use]
    pub fn with_cleanup_delay(mut self, step_id: &str, delay: Duration) -> Self {
        self.behavior(step_id).cleanup_delay = delay;
        self
    }

    /// Returns every call in order, as `run:<id>` or `cleanup:<id>`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Returns the ids of the steps whose body ran, in order.
    #[must_use]
    pub fn runs(&self) -> Vec<String> {
        self.calls_with_prefix("run:")
    }

    /// Returns the ids of the steps cleaned up, in order.
    #[must_use]
    pub fn cleanups(&self) -> Vec<String> {
        self.calls_with_prefix("cleanup:")
    }

    /// Returns how many times a step's body ran.
    #[must_use]
    pub fn run_count(&self, step_id: &str) -> usize {
        self.runs().iter().filter(|id| *id == step_id).count()
    }

    /// Returns the stage output a step saw when its body ran.
    #[must_use]
    pub fn observed_outputs(&self, step_id: &str) -> Option<StageOutput> {
        self.observed.lock().get(step_id).cloned()
    }

    fn calls_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| call.strip_prefix(prefix).map(ToString::to_string))
            .collect()
    }
}

#[async_trait]
impl UnitExecutor for RecordingUnitExecutor {
    async fn run(
        &self,
        token: &Arc<CancellationToken>,
        step: &UnitStep,
        outputs: &StageOutput,
        _account_id: &str,
    ) -> Result<StepOutput, EngineError> {
        self.calls.lock().push(format!("run:{}", step.id));
        self.observed.lock().insert(step.id.clone(), outputs.clone());
        let behavior = self.behaviors.get(&step.id).cloned().unwrap_or_default();

        if !behavior.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(behavior.delay) => {}
                () = token.cancelled() => {
                    return Err(EngineError::cancelled(&step.id, token.reason().unwrap_or_default()));
                }
            }
        }

        match behavior.failure {
            Some(Failure::Exit(code)) => Err(EngineError::execution(
                &step.id,
                1,
                Some(code),
                format!("exit status {code}"),
            )),
            Some(Failure::Timeout) => Err(EngineError::timeout(&step.id, 1, 1)),
            None => Ok(behavior.output),
        }
    }

    async fn cleanup(&self, _token: &Arc<CancellationToken>, step: &UnitStep) -> Result<(), EngineError> {
        self.calls.lock().push(format!("cleanup:{}", step.id));
        let behavior = self.behaviors.get(&step.id).cloned().unwrap_or_default();

        if !behavior.cleanup_delay.is_zero() {
            tokio::time::sleep(behavior.cleanup_delay).await;
        }
        if behavior.cleanup_fails {
            return Err(EngineError::cleanup(&step.id, "failed to release step resources"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::BufferedOutputSink;

    #[tokio::test]
    async fn test_scripted_launcher_replays_then_defaults() {
        let launcher = ScriptedLauncher::new().with_exits([3]).with_default_exit(1);
        let sink: Arc<dyn OutputSink> = Arc::new(BufferedOutputSink::new());
        let command = CommandSpec::new(vec!["make".to_string()]);

        let first = launcher
            .launch("s", &command, sink.clone(), CancellationToken::new())
            .await
            .unwrap();
        let second = launcher
            .launch("s", &command, sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first.code, Some(3));
        assert_eq!(second.code, Some(1));
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_recording_executor_tracks_calls() {
        let executor = RecordingUnitExecutor::new().fail("b", 2);
        let token = CancellationToken::new();

        let ok = executor
            .run(&token, &UnitStep::run("a", ["true"]), &StageOutput::new(), "acct")
            .await;
        let err = executor
            .run(&token, &UnitStep::run("b", ["false"]), &StageOutput::new(), "acct")
            .await;
        executor.cleanup(&token, &UnitStep::run("b", ["false"])).await.unwrap();

        assert!(ok.is_ok());
        assert!(matches!(err, Err(EngineError::Execution { exit_code: Some(2), .. })));
        assert_eq!(executor.calls(), vec!["run:a", "run:b", "cleanup:b"]);
        assert_eq!(executor.run_count("b"), 1);
    }
}
