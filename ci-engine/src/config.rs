//! Engine configuration.

use crate::core::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding [`EngineConfig::tmp_file_path`].
pub const ENV_TMP_PATH: &str = "CI_ENGINE_TMP_PATH";
/// Environment variable overriding [`EngineConfig::debug`].
pub const ENV_DEBUG: &str = "CI_ENGINE_DEBUG";
/// Environment variable overriding [`EngineConfig::cleanup_timeout_secs`].
pub const ENV_CLEANUP_TIMEOUT: &str = "CI_ENGINE_CLEANUP_TIMEOUT_SECS";

/// Configuration shared by the stage, parallel and unit executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for temporary files generated by steps.
    #[serde(default = "default_tmp_file_path")]
    pub tmp_file_path: PathBuf,
    /// Keep the process alive after the stage finishes, for inspection.
    #[serde(default)]
    pub debug: bool,
    /// Per-attempt timeout for steps that leave it unset.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Attempt count for steps that leave it unset.
    #[serde(default = "default_num_retries")]
    pub default_num_retries: u32,
    /// Upper bound on a single step's cleanup.
    #[serde(default = "default_cleanup_timeout_secs")]
    pub cleanup_timeout_secs: f64,
}

fn default_tmp_file_path() -> PathBuf {
    std::env::temp_dir().join("ci-engine")
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_num_retries() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_cleanup_timeout_secs() -> f64 {
    10.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tmp_file_path: default_tmp_file_path(),
            debug: false,
            default_timeout_secs: default_timeout_secs(),
            default_num_retries: default_num_retries(),
            cleanup_timeout_secs: default_cleanup_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from defaults overridden by environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup(ENV_TMP_PATH).filter(|p| !p.trim().is_empty()) {
            self.tmp_file_path = PathBuf::from(path);
        }
        if let Some(debug) = lookup(ENV_DEBUG) {
            self.debug = matches!(debug.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(raw) = lookup(ENV_CLEANUP_TIMEOUT) {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs > 0.0 => self.cleanup_timeout_secs = secs,
                _ => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_CLEANUP_TIMEOUT),
            }
        }
        self
    }

    /// Sets the temporary file directory.
    #[must_use]
    pub fn with_tmp_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tmp_file_path = path.into();
        self
    }

    /// Enables or disables debug mode.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the default per-attempt timeout.
    #[must_use]
    pub fn with_default_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    /// Sets the default attempt count.
    #[must_use]
    pub fn with_default_num_retries(mut self, attempts: u32) -> Self {
        self.default_num_retries = attempts;
        self
    }

    /// Sets the cleanup timeout.
    #[must_use]
    pub fn with_cleanup_timeout_secs(mut self, secs: f64) -> Self {
        self.cleanup_timeout_secs = secs;
        self
    }

    /// Gets the cleanup timeout as a duration.
    #[must_use]
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.cleanup_timeout_secs.max(0.001)).unwrap_or(Duration::MAX)
    }
}
