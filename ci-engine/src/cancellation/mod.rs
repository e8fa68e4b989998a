//! Structured cancellation and cleanup utilities.
//!
//! This module provides:
//! - CancellationToken for downward-cascading cooperative cancellation
//! - Bounded cleanup execution with failure records

mod cleanup;
mod token;

pub use cleanup::{run_cleanup, CleanupFailure};
pub use token::CancellationToken;
