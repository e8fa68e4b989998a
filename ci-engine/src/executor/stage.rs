//! Sequential stage execution.

use super::{ParallelExecutor, ProcessUnitExecutor, StageReport, StepRecord, UnitExecutor};
use crate::cancellation::{run_cleanup, CancellationToken, CleanupFailure};
use crate::codec::decode_stage;
use crate::config::EngineConfig;
use crate::core::{StageOutput, Step, StepStatus};
use crate::errors::EngineError;
use crate::events::{
    EventSink, NoOpEventSink, STAGE_COMPLETED, STAGE_STARTED, STEP_ATTEMPT, STEP_CLEANUP_FAILED,
    STEP_COMPLETED, STEP_FAILED, STEP_SKIPPED, STEP_STARTED,
};
use crate::runner::AttemptRecord;
use crate::observability::SpanTimer;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Runs the steps of one encoded stage in order.
///
/// The first failing step switches the executor into cleanup-only mode: no
/// further step bodies run, but every step, including the failed one and
/// those after it, is still cleaned up.
pub struct StageExecutor {
    encoded_stage: String,
    config: Arc<EngineConfig>,
    unit: Arc<dyn UnitExecutor>,
    events: Arc<dyn EventSink>,
    token: Arc<CancellationToken>,
    stage_output: StageOutput,
}

impl StageExecutor {
    /// Creates an executor for a base64 encoded stage payload.
    ///
    /// Unit steps run as local processes unless another unit executor is
    /// supplied.
    #[must_use]
    pub fn new(encoded_stage: impl Into<String>, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        Self {
            encoded_stage: encoded_stage.into(),
            unit: Arc::new(ProcessUnitExecutor::new(config.clone())),
            config,
            events: Arc::new(NoOpEventSink),
            token: CancellationToken::new(),
            stage_output: StageOutput::new(),
        }
    }

    /// Sets the executor used for unit steps and parallel members.
    #[must_use]
    pub fn with_unit_executor(mut self, unit: Arc<dyn UnitExecutor>) -> Self {
        self.unit = unit;
        self
    }

    /// Sets the sink receiving lifecycle events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the root cancellation token of the run.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Returns the root cancellation token of the run.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.token.clone()
    }

    /// Returns the outputs accumulated so far.
    #[must_use]
    pub fn stage_output(&self) -> &StageOutput {
        &self.stage_output
    }

    /// Runs the stage and returns the first execution error.
    ///
    /// In debug mode this never returns.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        self.run_with_report().await.into_result().map(|_| ())
    }

    /// Runs the stage and returns everything observed along the way.
    ///
    /// In debug mode this never returns.
    pub async fn run_with_report(&mut self) -> StageReport {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "stage",
            run_id = %run_id,
            account_id = tracing::field::Empty
        );

        let report = self.execute(run_id).instrument(span.clone()).await;

        if self.config.debug {
            span.in_scope(|| {
                info!(
                    success = report.is_success(),
                    "Debug mode enabled, holding the process open after stage completion"
                );
            });
            std::future::pending::<()>().await;
        }
        report
    }

    async fn execute(&mut self, run_id: Uuid) -> StageReport {
        let timer = SpanTimer::start("stage");
        let mut report = StageReport::new(run_id);
        self.stage_output = StageOutput::new();

        let execution = match decode_stage(&self.encoded_stage) {
            Ok(execution) => execution,
            Err(e) => {
                report.error = Some(e.into());
                report.duration_ms = timer.elapsed_ms();
                return report;
            }
        };
        tracing::Span::current().record("account_id", execution.account_id.as_str());

        info!(steps = execution.steps.len(), units = execution.unit_count(), "Executing stage");
        self.events
            .emit(
                STAGE_STARTED,
                Some(serde_json::json!({
                    "run_id": run_id.to_string(),
                    "account_id": execution.account_id,
                    "steps": execution.steps.len(),
                })),
            )
            .await;

        let parallel =
            ParallelExecutor::new(self.unit.clone()).with_cleanup_timeout(self.config.cleanup_timeout());
        let mut cleanup_only = false;
        report.steps = execution.steps.iter().map(StepRecord::pending).collect();

        for (index, step) in execution.steps.iter().enumerate() {
            let status = if cleanup_only {
                self.emit_step(STEP_SKIPPED, step, None).await;
                StepStatus::Skipped
            } else {
                self.emit_step(STEP_STARTED, step, None).await;
                let result = self.execute_step(&parallel, step, &execution.account_id).await;
                let attempts = self.attempts(step);
                for attempt in &attempts {
                    let data = serde_json::json!({ "attempt": attempt });
                    self.emit_step(STEP_ATTEMPT, step, Some(data)).await;
                }
                report.steps[index].attempts = attempts;
                match result {
                    Ok(()) => {
                        self.emit_step(STEP_COMPLETED, step, None).await;
                        StepStatus::Succeeded
                    }
                    Err(err) => {
                        error!(step_id = %step.id(), error = %err, "Step failed, cleaning up remaining steps");
                        let error = serde_json::Value::Object(err.to_dict().into_iter().collect());
                        self.emit_step(STEP_FAILED, step, Some(serde_json::json!({ "error": error })))
                            .await;
                        report.error = Some(err);
                        cleanup_only = true;
                        StepStatus::Failed
                    }
                }
            };

            let failures = self.cleanup_step(&parallel, step).await;
            let cleaned_up = failures.is_empty();
            for failure in failures {
                warn!(step_id = %step.id(), error = %failure, "Failed to clean up step");
                let failure = CleanupFailure::new(failure.step_id().unwrap_or(step.id()), failure.to_string());
                self.emit_step(
                    STEP_CLEANUP_FAILED,
                    step,
                    Some(serde_json::json!({
                        "cleanup": {
                            "member_id": failure.step_id,
                            "message": failure.message,
                        },
                    })),
                )
                .await;
                report.cleanup_failures.push(failure);
            }

            let record = &mut report.steps[index];
            record.status = status;
            record.cleaned_up = cleaned_up;
        }

        report.outputs = self.stage_output.clone();
        report.duration_ms = timer.elapsed_ms();

        info!(
            success = report.is_success(),
            cleanup_failures = report.cleanup_failures.len(),
            elapsed_time_ms = report.duration_ms,
            "Stage finished"
        );
        self.events
            .emit(
                STAGE_COMPLETED,
                Some(serde_json::json!({
                    "run_id": run_id.to_string(),
                    "success": report.is_success(),
                    "duration_ms": report.duration_ms,
                })),
            )
            .await;

        report
    }

    async fn execute_step(
        &mut self,
        parallel: &ParallelExecutor,
        step: &Step,
        account_id: &str,
    ) -> Result<(), EngineError> {
        if self.token.is_cancelled() {
            return Err(EngineError::cancelled(
                step.id(),
                self.token.reason().unwrap_or_default(),
            ));
        }

        match step {
            Step::Unit(unit) => {
                let output = self
                    .unit
                    .run(&self.token, unit, &self.stage_output, account_id)
                    .await?;
                self.stage_output.insert(unit.id.clone(), output);
                Ok(())
            }
            Step::Parallel(group) => {
                let outcome = parallel
                    .run(&self.token, group, &self.stage_output, account_id)
                    .await;
                self.stage_output.merge(outcome.outputs);
                match outcome.error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }

    async fn cleanup_step(&self, parallel: &ParallelExecutor, step: &Step) -> Vec<EngineError> {
        match step {
            Step::Unit(unit) => run_cleanup(
                &unit.id,
                self.config.cleanup_timeout(),
                self.unit.cleanup(&self.token, unit),
            )
            .await
            .err()
            .into_iter()
            .collect(),
            Step::Parallel(group) => parallel.cleanup_members(&self.token, group).await,
        }
    }

    fn attempts(&self, step: &Step) -> Vec<AttemptRecord> {
        match step {
            Step::Unit(unit) => self.unit.attempts(&unit.id),
            Step::Parallel(group) => group
                .steps
                .iter()
                .flat_map(|member| self.unit.attempts(&member.id))
                .collect(),
        }
    }

    async fn emit_step(&self, event_type: &str, step: &Step, extra: Option<serde_json::Value>) {
        let mut data = serde_json::json!({
            "step_id": step.id(),
            "step_type": step.type_name(),
            "display_name": step.display_name(),
        });
        if let (Some(serde_json::Value::Object(extra)), Some(map)) = (extra, data.as_object_mut()) {
            map.extend(extra);
        }
        self.events.emit(event_type, Some(data)).await;
    }
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("config", &self.config)
            .field("stage_output", &self.stage_output)
            .finish_non_exhaustive()
    }
}

/// Executes an encoded stage with the default process-backed executors.
///
/// The terminal error is logged together with the payload it came from.
pub async fn execute_stage(encoded_stage: &str, config: EngineConfig) -> Result<StageOutput, EngineError> {
    let mut executor = StageExecutor::new(encoded_stage, config);
    executor.run_with_report().await.into_result().inspect_err(|err| {
        error!(
            embedded_stage = %encoded_stage,
            error = %err,
            "error encountered while executing stage"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_stage;
    use crate::core::{Execution, ParallelStep, StepOutput, UnitStep};
    use crate::events::CollectingEventSink;
    use crate::testing::{assert_cleaned_up, assert_stage_failed_at, assert_step_status, RecordingUnitExecutor};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn stage(ids: &[&str]) -> String {
        let execution = ids
            .iter()
            .fold(Execution::new("acct"), |execution, id| execution.with_step(UnitStep::run(*id, ["true"])));
        encode_stage(&execution).unwrap()
    }

    fn executor(encoded: String, unit: Arc<RecordingUnitExecutor>) -> StageExecutor {
        StageExecutor::new(encoded, EngineConfig::new()).with_unit_executor(unit)
    }

    #[tokio::test]
    async fn test_all_steps_run_in_order() {
        let unit = Arc::new(RecordingUnitExecutor::new());
        let mut executor = executor(stage(&["a", "b", "c"]), unit.clone());

        executor.run().await.unwrap();

        assert_eq!(
            unit.calls(),
            vec!["run:a", "cleanup:a", "run:b", "cleanup:b", "run:c", "cleanup:c"]
        );
        assert_eq!(executor.stage_output().step_ids(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failure_switches_to_cleanup_only() {
        let unit = Arc::new(RecordingUnitExecutor::new().fail("b", 2));
        let mut executor = executor(stage(&["a", "b", "c", "d"]), unit.clone());

        let report = executor.run_with_report().await;

        assert_eq!(unit.runs(), vec!["a", "b"]);
        assert_eq!(unit.cleanups(), vec!["a", "b", "c", "d"]);
        assert_stage_failed_at(&report, "b");
        assert_step_status(&report, "a", StepStatus::Succeeded);
        assert_step_status(&report, "b", StepStatus::Failed);
        assert_step_status(&report, "c", StepStatus::Skipped);
        assert_step_status(&report, "d", StepStatus::Skipped);
        assert_cleaned_up(&report, &["a", "b", "c", "d"]);
        assert!(!report.outputs.contains("b"));
    }

    #[tokio::test]
    async fn test_later_steps_see_earlier_outputs() {
        let unit = Arc::new(RecordingUnitExecutor::new().succeed("a", StepOutput::new().with_var("V", "1")));
        let mut executor = executor(stage(&["a", "b"]), unit.clone());

        executor.run().await.unwrap();

        assert!(unit.observed_outputs("a").unwrap().is_empty());
        assert_eq!(unit.observed_outputs("b").unwrap().lookup("a", "V"), Some("1"));
    }

    #[tokio::test]
    async fn test_parallel_outputs_merged_after_join() {
        let execution = Execution::new("acct")
            .with_step(
                ParallelStep::new("group")
                    .with_step(UnitStep::run("g1", ["true"]))
                    .with_step(UnitStep::run("g2", ["true"])),
            )
            .with_step(UnitStep::run("after", ["true"]));
        let unit = Arc::new(
            RecordingUnitExecutor::new()
                .succeed("g1", StepOutput::new().with_var("A", "1"))
                .succeed("g2", StepOutput::new().with_var("B", "2")),
        );
        let mut executor = executor(encode_stage(&execution).unwrap(), unit.clone());

        executor.run().await.unwrap();

        assert!(unit.observed_outputs("g2").unwrap().is_empty());
        let seen = unit.observed_outputs("after").unwrap();
        assert_eq!(seen.lookup("g1", "A"), Some("1"));
        assert_eq!(seen.lookup("g2", "B"), Some("2"));
        assert!(!executor.stage_output().contains("group"));
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_fail_stage() {
        let unit = Arc::new(RecordingUnitExecutor::new().fail_cleanup("a"));
        let events = Arc::new(CollectingEventSink::new());
        let mut executor = executor(stage(&["a", "b"]), unit.clone()).with_event_sink(events.clone());

        let report = executor.run_with_report().await;

        assert!(report.is_success());
        assert_eq!(unit.runs(), vec!["a", "b"]);
        assert_eq!(report.cleanup_failures.len(), 1);
        assert_eq!(report.cleanup_failures[0].step_id, "a");
        assert!(!report.step("a").unwrap().cleaned_up);
        assert_eq!(events.events_of_type(STEP_CLEANUP_FAILED).len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_bounded_by_timeout() {
        let unit = Arc::new(RecordingUnitExecutor::new().with_cleanup_delay("a", Duration::from_secs(30)));
        let config = EngineConfig::new().with_cleanup_timeout_secs(0.05);
        let mut executor = StageExecutor::new(stage(&["a", "b"]), config).with_unit_executor(unit.clone());

        let report = tokio::time::timeout(Duration::from_secs(5), executor.run_with_report())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(unit.cleanups(), vec!["a", "b"]);
        assert!(report.cleanup_failures[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let unit = Arc::new(RecordingUnitExecutor::new().fail("b", 1));
        let events = Arc::new(CollectingEventSink::new());
        let mut executor = executor(stage(&["a", "b", "c"]), unit).with_event_sink(events.clone());

        let _ = executor.run().await;

        assert_eq!(
            events.event_types(),
            vec![
                STAGE_STARTED,
                STEP_STARTED,
                STEP_COMPLETED,
                STEP_STARTED,
                STEP_FAILED,
                STEP_SKIPPED,
                STAGE_COMPLETED,
            ]
        );
        let failed = events.events_of_type(STEP_FAILED);
        let data = failed[0].1.as_ref().unwrap();
        assert_eq!(data["step_id"], "b");
        assert_eq!(data["error"]["type"], "ExecutionError");
    }

    #[tokio::test]
    async fn test_decode_failure_runs_nothing() {
        let unit = Arc::new(RecordingUnitExecutor::new());
        let events = Arc::new(CollectingEventSink::new());
        let mut executor = executor("%%%".to_string(), unit.clone()).with_event_sink(events.clone());

        let err = executor.run().await.unwrap_err();

        assert!(matches!(err, EngineError::Decode(_)));
        assert!(unit.calls().is_empty());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_stage_skips_bodies_but_cleans_up() {
        let unit = Arc::new(RecordingUnitExecutor::new());
        let token = CancellationToken::new();
        token.cancel("pipeline aborted");
        let mut executor = executor(stage(&["a", "b"]), unit.clone()).with_cancellation_token(token);

        let report = executor.run_with_report().await;

        assert!(unit.runs().is_empty());
        assert_eq!(unit.cleanups(), vec!["a", "b"]);
        assert!(matches!(report.error, Some(EngineError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_empty_stage_succeeds() {
        let unit = Arc::new(RecordingUnitExecutor::new());
        let mut executor = executor(stage(&[]), unit.clone());

        let report = executor.run_with_report().await;

        assert!(report.is_success());
        assert!(report.steps.is_empty());
        assert!(report.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_stage_output_reset_between_runs() {
        let unit = Arc::new(RecordingUnitExecutor::new().fail("b", 1));
        let mut executor = executor(stage(&["a", "b"]), unit.clone());

        let _ = executor.run().await;
        let _ = executor.run().await;

        assert_eq!(unit.observed_outputs("a").unwrap(), StageOutput::new());
        assert_eq!(executor.stage_output().step_ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_every_visited_step_has_terminal_status() {
        let unit = Arc::new(RecordingUnitExecutor::new().fail("b", 1));
        let mut executor = executor(stage(&["a", "b", "c"]), unit);

        let report = executor.run_with_report().await;

        assert_eq!(report.step_ids(), vec!["a", "b", "c"]);
        assert!(report.steps.iter().all(|record| record.status.is_terminal()));
        assert!(report.steps_with_status(StepStatus::Pending).is_empty());
    }

    #[tokio::test]
    async fn test_attempts_reported_per_step() {
        use crate::runner::{AttemptOutcome, BufferedOutputSink};
        use crate::testing::ScriptedLauncher;

        let execution = Execution::new("acct")
            .with_step(UnitStep::run("flaky", ["make"]).with_limits(crate::core::StepLimits::new(10, 2)))
            .with_step(
                ParallelStep::new("group")
                    .with_step(UnitStep::run("g1", ["true"]))
                    .with_step(UnitStep::run("g2", ["true"])),
            );
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new().with_tmp_file_path(dir.path());
        let unit = ProcessUnitExecutor::new(Arc::new(config.clone()))
            .with_launcher(Arc::new(ScriptedLauncher::new().with_exits([1, 0])))
            .with_output_sink(Arc::new(BufferedOutputSink::new()));
        let events = Arc::new(CollectingEventSink::new());
        let mut executor = StageExecutor::new(encode_stage(&execution).unwrap(), config)
            .with_unit_executor(Arc::new(unit))
            .with_event_sink(events.clone());

        let report = executor.run_with_report().await;

        assert!(report.is_success());
        let flaky = &report.step("flaky").unwrap().attempts;
        let outcomes: Vec<_> = flaky.iter().map(|record| record.outcome).collect();
        assert_eq!(outcomes, vec![AttemptOutcome::Failed, AttemptOutcome::Succeeded]);
        let group = &report.step("group").unwrap().attempts;
        let mut members: Vec<_> = group.iter().map(|record| record.step_id.as_str()).collect();
        members.sort_unstable();
        assert_eq!(members, vec!["g1", "g2"]);

        let attempt_events = events.events_of_type(STEP_ATTEMPT);
        assert_eq!(attempt_events.len(), 4);
        let first = attempt_events[0].1.as_ref().unwrap();
        assert_eq!(first["step_id"], "flaky");
        assert_eq!(first["attempt"]["attempt"], 1);
        assert_eq!(first["attempt"]["outcome"], "failed");
        assert_eq!(report.to_dict()["steps"][0]["attempts"][1]["outcome"], "succeeded");
    }
}
