//! Error types for the CI execution engine.
//!
//! Every failure a stage run can surface is one variant of [`EngineError`].
//! Step-level variants carry the step id so a single terminal error is
//! enough to locate the failing step in the logs.

use std::collections::HashMap;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The stage payload could not be decoded.
    #[error("{0}")]
    Decode(#[from] DecodeError),

    /// A step configuration could not be turned into an invocable command.
    #[error("Failed to resolve command for step '{step_id}': {reason}")]
    Resolution {
        /// The step id.
        step_id: String,
        /// Why resolution failed.
        reason: String,
    },

    /// A step resolved to an empty command sequence.
    #[error("Resolved command for step '{step_id}' is empty")]
    EmptyCommand {
        /// The step id.
        step_id: String,
    },

    /// An attempt exceeded its deadline.
    #[error("Step '{step_id}' timed out after {timeout_secs}s on attempt {attempt}")]
    Timeout {
        /// The step id.
        step_id: String,
        /// The attempt that timed out (1-indexed).
        attempt: u32,
        /// The per-attempt deadline in seconds.
        timeout_secs: u64,
    },

    /// The process could not be started or exited unsuccessfully.
    #[error("Step '{step_id}' failed on attempt {attempt}: {reason}")]
    Execution {
        /// The step id.
        step_id: String,
        /// The failing attempt (1-indexed).
        attempt: u32,
        /// Exit code, when the process ran to completion.
        exit_code: Option<i32>,
        /// Failure description.
        reason: String,
    },

    /// One or more members of a parallel group failed.
    #[error("Parallel step '{group_id}' failed ({failed} of {total} members): {first}")]
    Aggregate {
        /// The parallel step id.
        group_id: String,
        /// Number of failed members.
        failed: usize,
        /// Number of members in the group.
        total: usize,
        /// The first member error observed.
        first: Box<EngineError>,
    },

    /// Execution was cancelled by a parent token.
    #[error("Step '{step_id}' cancelled: {reason}")]
    Cancelled {
        /// The step id.
        step_id: String,
        /// The cancellation reason.
        reason: String,
    },

    /// Releasing a step's resources failed.
    #[error("Cleanup failed for step '{step_id}': {reason}")]
    Cleanup {
        /// The step id.
        step_id: String,
        /// Failure description.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a resolution error.
    #[must_use]
    pub fn resolution(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an empty command error.
    #[must_use]
    pub fn empty_command(step_id: impl Into<String>) -> Self {
        Self::EmptyCommand {
            step_id: step_id.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(step_id: impl Into<String>, attempt: u32, timeout_secs: u64) -> Self {
        Self::Timeout {
            step_id: step_id.into(),
            attempt,
            timeout_secs,
        }
    }

    /// Creates an execution error.
    #[must_use]
    pub fn execution(
        step_id: impl Into<String>,
        attempt: u32,
        exit_code: Option<i32>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Execution {
            step_id: step_id.into(),
            attempt,
            exit_code,
            reason: reason.into(),
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a cleanup error.
    #[must_use]
    pub fn cleanup(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Cleanup {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for failures that can never succeed on a later attempt.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::Resolution { .. } | Self::EmptyCommand { .. } | Self::Cancelled { .. }
        )
    }

    /// Returns true if this is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns the step id the error is attributed to, if any.
    #[must_use]
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::Resolution { step_id, .. }
            | Self::EmptyCommand { step_id }
            | Self::Timeout { step_id, .. }
            | Self::Execution { step_id, .. }
            | Self::Cancelled { step_id, .. }
            | Self::Cleanup { step_id, .. } => Some(step_id),
            Self::Aggregate { group_id, .. } => Some(group_id),
            Self::Decode(_) | Self::Io(_) => None,
        }
    }

    /// Unwraps aggregate errors down to the member error that caused them.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Aggregate { first, .. } => first.root_cause(),
            other => other,
        }
    }

    /// Returns a short type tag for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "DecodeError",
            Self::Resolution { .. } => "ResolutionError",
            Self::EmptyCommand { .. } => "EmptyCommandError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Execution { .. } => "ExecutionError",
            Self::Aggregate { .. } => "AggregateError",
            Self::Cancelled { .. } => "CancelledError",
            Self::Cleanup { .. } => "CleanupError",
            Self::Io(_) => "IoError",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        if let Some(step_id) = self.step_id() {
            map.insert("step_id".to_string(), serde_json::json!(step_id));
        }

        match self {
            Self::Timeout { attempt, timeout_secs, .. } => {
                map.insert("attempt".to_string(), serde_json::json!(attempt));
                map.insert("timeout_secs".to_string(), serde_json::json!(timeout_secs));
            }
            Self::Execution { attempt, exit_code, .. } => {
                map.insert("attempt".to_string(), serde_json::json!(attempt));
                if let Some(code) = exit_code {
                    map.insert("exit_code".to_string(), serde_json::json!(code));
                }
            }
            Self::Aggregate { failed, total, first, .. } => {
                map.insert("failed".to_string(), serde_json::json!(failed));
                map.insert("total".to_string(), serde_json::json!(total));
                let first_map: serde_json::Map<String, serde_json::Value> =
                    first.to_dict().into_iter().collect();
                map.insert("first".to_string(), serde_json::Value::Object(first_map));
            }
            _ => {}
        }

        map
    }
}

/// Error raised when a stage payload cannot be decoded.
///
/// Decoding fails at one of two points: the transport encoding (base64) or
/// the structural deserialization of the decoded bytes.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// The payload is not valid base64.
    #[error("Failed to decode stage: {0}")]
    Transport(String),

    /// The decoded bytes are not a valid execution description.
    #[error("Failed to deserialize stage: {0}")]
    Structure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::empty_command("s").is_fatal());
        assert!(EngineError::resolution("s", "no such image").is_fatal());
        assert!(!EngineError::timeout("s", 1, 5).is_fatal());
        assert!(!EngineError::execution("s", 1, Some(2), "exit 2").is_fatal());
    }

    #[test]
    fn test_timeout_display() {
        let err = EngineError::timeout("build", 2, 30);
        assert_eq!(err.to_string(), "Step 'build' timed out after 30s on attempt 2");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_aggregate_root_cause() {
        let err = EngineError::Aggregate {
            group_id: "group".to_string(),
            failed: 1,
            total: 2,
            first: Box::new(EngineError::execution("b1", 1, Some(1), "exit status 1")),
        };

        assert_eq!(err.step_id(), Some("group"));
        assert_eq!(err.root_cause().step_id(), Some("b1"));
    }

    #[test]
    fn test_error_to_dict() {
        let err = EngineError::execution("lint", 3, Some(127), "command not found");
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "ExecutionError");
        assert_eq!(dict.get("step_id").unwrap(), "lint");
        assert_eq!(dict.get("exit_code").unwrap(), 127);
    }

    #[test]
    fn test_decode_error_conversion() {
        let err: EngineError = DecodeError::Transport("invalid byte".to_string()).into();
        assert!(err.is_fatal());
        assert_eq!(err.kind(), "DecodeError");
        assert!(err.step_id().is_none());
    }
}
