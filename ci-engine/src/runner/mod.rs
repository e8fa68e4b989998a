//! Step runner: turns one unit step into process attempts.
//!
//! This module provides:
//! - Command resolution for each step kind
//! - Output interpolation of earlier step outputs
//! - Process launching with streamed output
//! - The retry/timeout task wrapping a step's attempts

mod interpolate;
mod launcher;
mod resolver;
mod sink;
mod task;

pub use interpolate::{has_references, interpolate};
pub use launcher::{CommandSpec, OsProcessLauncher, ProcessExit, ProcessLauncher};
pub use resolver::{resolve_command, EntrypointResolver, StaticEntrypointResolver};
pub use sink::{BufferedOutputSink, OutputSink, TracingOutputSink};
pub use task::{AttemptOutcome, AttemptRecord, StepTask, TaskOutcome};
