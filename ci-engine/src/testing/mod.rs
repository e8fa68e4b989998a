//! Testing utilities for stage executions.
//!
//! This module provides:
//! - A scripted process launcher for step runner tests
//! - A recording unit executor for stage and parallel tests
//! - Assertions over stage reports

mod assertions;
mod mocks;

pub use assertions::{assert_cleaned_up, assert_step_status, assert_stage_failed_at};
pub use mocks::{RecordingUnitExecutor, ScriptedLauncher};
