//! Summary of a finished stage run.

use crate::cancellation::CleanupFailure;
use crate::core::{StageOutput, Step, StepStatus};
use crate::errors::EngineError;
use crate::runner::AttemptRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// What happened to one top-level step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// The step id.
    pub step_id: String,
    /// `unit` or `parallel`.
    pub step_type: String,
    /// Outcome of the step body.
    pub status: StepStatus,
    /// Whether the step's cleanup completed without error.
    pub cleaned_up: bool,
    /// Attempts made by the step's units, in order of completion per unit.
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl StepRecord {
    pub(crate) fn pending(step: &Step) -> Self {
        Self {
            step_id: step.id().to_string(),
            step_type: step.type_name().to_string(),
            status: StepStatus::Pending,
            cleaned_up: false,
            attempts: Vec::new(),
        }
    }
}

/// Result of a stage run with everything observed along the way.
#[derive(Debug)]
pub struct StageReport {
    /// Identifier of the run, shared with the tracing span.
    pub run_id: Uuid,
    /// Outputs accumulated by successful steps.
    pub outputs: StageOutput,
    /// The first execution error, if any.
    pub error: Option<EngineError>,
    /// Cleanups that failed or timed out.
    pub cleanup_failures: Vec<CleanupFailure>,
    /// One record per visited top-level step, in declared order.
    pub steps: Vec<StepRecord>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Total run duration in milliseconds.
    pub duration_ms: u64,
}

impl StageReport {
    pub(crate) fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            outputs: StageOutput::new(),
            error: None,
            cleanup_failures: Vec::new(),
            steps: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Returns true if no step failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Returns the record of a step.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|record| record.step_id == step_id)
    }

    /// Returns the ids of the visited steps, in order.
    #[must_use]
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|record| record.step_id.as_str()).collect()
    }

    /// Returns the ids of the steps with the given status.
    #[must_use]
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|record| record.status == status)
            .map(|record| record.step_id.as_str())
            .collect()
    }

    /// Converts into the terminal result of the run.
    pub fn into_result(self) -> Result<StageOutput, EngineError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.outputs),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("run_id".to_string(), serde_json::json!(self.run_id.to_string()));
        map.insert("success".to_string(), serde_json::json!(self.is_success()));
        map.insert("started_at".to_string(), serde_json::json!(self.started_at.to_rfc3339()));
        map.insert("duration_ms".to_string(), serde_json::json!(self.duration_ms));
        map.insert("steps".to_string(), serde_json::json!(self.steps));
        map.insert("outputs".to_string(), serde_json::json!(self.outputs));
        map.insert(
            "cleanup_failures".to_string(),
            serde_json::json!(self.cleanup_failures),
        );
        if let Some(err) = &self.error {
            let error: serde_json::Map<String, serde_json::Value> = err.to_dict().into_iter().collect();
            map.insert("error".to_string(), serde_json::Value::Object(error));
        }
        map
    }
}
