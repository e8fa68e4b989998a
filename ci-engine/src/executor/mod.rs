//! Stage, parallel and unit executors.
//!
//! This module provides:
//! - The `UnitExecutor` seam and its process-backed implementation
//! - Concurrent execution of parallel groups with join-then-merge outputs
//! - The sequential stage executor with its cleanup-only mode
//! - Stage reports summarizing a run

mod parallel;
mod report;
mod stage;
mod unit;

pub use parallel::{ParallelExecutor, ParallelOutcome};
pub use report::{StageReport, StepRecord};
pub use stage::{execute_stage, StageExecutor};
pub use unit::{ProcessUnitExecutor, UnitExecutor, OUTPUT_FILE_ENV};
