//! Bounded cleanup execution.

use crate::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// A cleanup that did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// The step whose resources were being released.
    pub step_id: String,
    /// Failure description.
    pub message: String,
}

impl CleanupFailure {
    /// Creates a cleanup failure record.
    #[must_use]
    pub fn new(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            message: message.into(),
        }
    }
}

/// Runs a cleanup future, bounding it by a timeout.
///
/// A cleanup that exceeds the timeout is reported as an
/// [`EngineError::Cleanup`] for the step.
pub async fn run_cleanup<F>(step_id: &str, timeout: Duration, cleanup: F) -> Result<(), EngineError>
where
    F: Future<Output = Result<(), EngineError>>,
{
    match tokio::time::timeout(timeout, cleanup).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                step_id = %step_id,
                timeout_ms = timeout.as_millis() as u64,
                "Cleanup timed out"
            );
            Err(EngineError::cleanup(
                step_id,
                format!("cleanup timed out after {}ms", timeout.as_millis()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_success_passes_through() {
        let result = run_cleanup("a", Duration::from_secs(1), async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_error_passes_through() {
        let result = run_cleanup("a", Duration::from_secs(1), async {
            Err(EngineError::cleanup("a", "container still running"))
        })
        .await;

        assert!(matches!(result, Err(EngineError::Cleanup { .. })));
    }

    #[tokio::test]
    async fn test_cleanup_timeout() {
        let result = run_cleanup("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.step_id(), Some("slow"));
        assert!(err.to_string().contains("timed out"));
    }
}
