//! Core domain model types for the engine.
//!
//! This module contains the fundamental types used throughout the crate:
//! - The decoded stage description (execution, steps, step kinds)
//! - Step and stage output stores
//! - The resolved retry/timeout policy
//! - Step status

mod output;
mod policy;
mod status;
mod step;

pub use output::{StageOutput, StepOutput};
pub use policy::{ExecutionPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS};
pub use status::StepStatus;
pub use step::{Execution, ParallelStep, PluginStep, RunStep, Step, StepKind, StepLimits, UnitStep};
