//! Resolved timeout and retry policy for a unit step.

use super::StepLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-attempt timeout used when a step leaves it unset (4 hours).
pub const DEFAULT_TIMEOUT_SECS: u64 = 14_400;

/// Attempt count used when a step leaves it unset (no retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Timeout and attempt budget of a step, resolved once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Deadline applied to each attempt separately.
    pub timeout_secs: u64,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ExecutionPolicy {
    /// Resolves limits against the built-in defaults.
    #[must_use]
    pub fn resolve(limits: &StepLimits) -> Self {
        Self::resolve_with(limits, DEFAULT_TIMEOUT_SECS, DEFAULT_MAX_ATTEMPTS)
    }

    /// Resolves limits, substituting the given defaults for zero values.
    ///
    /// A zero default falls back to the built-in default in turn.
    #[must_use]
    pub fn resolve_with(limits: &StepLimits, default_timeout_secs: u64, default_attempts: u32) -> Self {
        let timeout_secs = [limits.execution_timeout_secs, default_timeout_secs]
            .into_iter()
            .find(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let max_attempts = [limits.num_retries, default_attempts]
            .into_iter()
            .find(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Self {
            timeout_secs,
            max_attempts,
        }
    }

    /// Returns the per-attempt timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
