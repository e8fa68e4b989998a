//! Event sink system for stage lifecycle observability.
//!
//! The stage executor reports every step transition to an [`EventSink`];
//! the event type names are collected here so sinks and tests agree on them.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Emitted once the payload has been decoded and execution begins.
pub const STAGE_STARTED: &str = "stage.started";
/// Emitted after every step has been visited.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// Emitted before a step body runs.
pub const STEP_STARTED: &str = "step.started";
/// Emitted after a step body succeeds.
pub const STEP_COMPLETED: &str = "step.completed";
/// Emitted after a step body fails.
pub const STEP_FAILED: &str = "step.failed";
/// Emitted for steps whose body is not run because an earlier step failed.
pub const STEP_SKIPPED: &str = "step.skipped";
/// Emitted when releasing a step's resources fails.
pub const STEP_CLEANUP_FAILED: &str = "step.cleanup_failed";
/// Emitted for every finished attempt of a unit step, before the step's outcome.
pub const STEP_ATTEMPT: &str = "step.attempt";
