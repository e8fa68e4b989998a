//! Concurrent execution of parallel step groups.

use super::UnitExecutor;
use crate::cancellation::{run_cleanup, CancellationToken};
use crate::core::{ParallelStep, StageOutput, StepOutput};
use crate::errors::EngineError;
use crate::observability::SpanTimer;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Result of running a parallel group.
///
/// Outputs of the members that succeeded are kept even when another member
/// failed.
#[derive(Debug, Default)]
pub struct ParallelOutcome {
    /// Outputs keyed by member step id.
    pub outputs: HashMap<String, StepOutput>,
    /// The first member error in completion order, wrapped as an aggregate.
    pub error: Option<EngineError>,
    /// Ids of the members that failed, in completion order.
    pub failed: Vec<String>,
}

impl ParallelOutcome {
    /// Returns true if every member succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Converts into the outputs, or the aggregate error.
    pub fn into_result(self) -> Result<HashMap<String, StepOutput>, EngineError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.outputs),
        }
    }
}

/// Runs the members of a parallel step concurrently.
///
/// Every member runs to completion: a failing member never cancels its
/// siblings.
#[derive(Clone)]
pub struct ParallelExecutor {
    unit: Arc<dyn UnitExecutor>,
    cleanup_timeout: Duration,
}

impl ParallelExecutor {
    /// Creates a parallel executor dispatching members to `unit`.
    #[must_use]
    pub fn new(unit: Arc<dyn UnitExecutor>) -> Self {
        Self {
            unit,
            cleanup_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the bound on each member's cleanup.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Runs every member and waits for all of them.
    ///
    /// Members see `outputs` as it was when the group started; the group's
    /// own outputs are returned for the caller to merge after the join.
    pub async fn run(
        &self,
        token: &Arc<CancellationToken>,
        step: &ParallelStep,
        outputs: &StageOutput,
        account_id: &str,
    ) -> ParallelOutcome {
        let timer = SpanTimer::start(&step.id);
        let snapshot = Arc::new(outputs.clone());

        let mut pending = FuturesUnordered::new();
        for member in &step.steps {
            let unit = self.unit.clone();
            let member = member.clone();
            let snapshot = snapshot.clone();
            let token = token.clone();
            let account_id = account_id.to_string();
            let member_id = member.id.clone();

            let handle = tokio::spawn(async move {
                unit.run(&token, &member, &snapshot, &account_id).await
            });
            pending.push(async move { (member_id, handle.await) });
        }

        let mut outcome = ParallelOutcome::default();
        let mut first_error = None;
        while let Some((member_id, joined)) = pending.next().await {
            let result = joined.unwrap_or_else(|e| {
                if e.is_panic() {
                    Err(EngineError::execution(&member_id, 1, None, "step task panicked"))
                } else {
                    Err(EngineError::cancelled(&member_id, e.to_string()))
                }
            });

            match result {
                Ok(output) => {
                    outcome.outputs.insert(member_id, output);
                }
                Err(err) => {
                    error!(
                        group_id = %step.id,
                        step_id = %member_id,
                        error = %err,
                        "Parallel member failed"
                    );
                    outcome.failed.push(member_id);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        outcome.error = first_error.map(|first| EngineError::Aggregate {
            group_id: step.id.clone(),
            failed: outcome.failed.len(),
            total: step.steps.len(),
            first: Box::new(first),
        });

        info!(
            group_id = %step.id,
            members = step.steps.len(),
            failed = outcome.failed.len(),
            elapsed_time_ms = timer.elapsed_ms(),
            "Parallel step finished"
        );
        outcome
    }

    /// Cleans up every member concurrently and returns the failures.
    ///
    /// Each member's cleanup is bounded by the cleanup timeout.
    pub async fn cleanup_members(&self, token: &Arc<CancellationToken>, step: &ParallelStep) -> Vec<EngineError> {
        let cleanups = step.steps.iter().map(|member| {
            run_cleanup(&member.id, self.cleanup_timeout, self.unit.cleanup(token, member))
        });

        futures::future::join_all(cleanups)
            .await
            .into_iter()
            .filter_map(Result::err)
            .inspect(|err| warn!(group_id = %step.id, error = %err, "Parallel member cleanup failed"))
            .collect()
    }

    /// Cleans up every member, returning the first failure.
    pub async fn cleanup(&self, token: &Arc<CancellationToken>, step: &ParallelStep) -> Result<(), EngineError> {
        match self.cleanup_members(token, step).await.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("cleanup_timeout", &self.cleanup_timeout)
            .finish_non_exhaustive()
    }
}
