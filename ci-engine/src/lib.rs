//! # ci-engine
//!
//! The execution core of a CI pipeline runner.
//!
//! A stage arrives as an encoded, ordered list of steps. Each step is either
//! a single unit of work or a group of units run concurrently. The engine
//! provides:
//!
//! - **Sequential stage execution**: steps run in declared order; after the
//!   first failure no new work starts, but every step is still cleaned up
//! - **Parallel groups**: members run concurrently and their outputs are
//!   merged once all of them finish
//! - **Bounded retries and timeouts**: each unit step's process gets a
//!   per-attempt deadline and a fixed attempt budget
//! - **Output propagation**: step outputs are kept per stage and can be
//!   referenced by later steps
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ci_engine::prelude::*;
//!
//! let config = EngineConfig::from_env();
//! let mut executor = StageExecutor::new(encoded_stage, config)
//!     .with_event_sink(Arc::new(LoggingEventSink::default()));
//!
//! executor.run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod codec;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod observability;
pub mod runner;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, CleanupFailure};
    pub use crate::codec::{decode_stage, encode_stage};
    pub use crate::config::EngineConfig;
    pub use crate::core::{
        Execution, ExecutionPolicy, ParallelStep, Step, StepKind, StepLimits, StageOutput,
        StepOutput, StepStatus, UnitStep,
    };
    pub use crate::errors::{DecodeError, EngineError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{
        execute_stage, ParallelExecutor, ProcessUnitExecutor, StageExecutor, StageReport,
        UnitExecutor,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::runner::{
        EntrypointResolver, OsProcessLauncher, ProcessLauncher, StaticEntrypointResolver,
    };
}

/// Version of the ci-engine crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
