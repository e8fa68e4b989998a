//! Unit step execution.

use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::core::{ExecutionPolicy, StageOutput, StepKind, StepOutput, UnitStep};
use crate::errors::EngineError;
use crate::runner::{
    AttemptRecord, EntrypointResolver, OsProcessLauncher, OutputSink, ProcessLauncher,
    StaticEntrypointResolver, StepTask, TracingOutputSink,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Environment variable pointing a step's process at its output file.
pub const OUTPUT_FILE_ENV: &str = "STEP_OUTPUT_FILE";

/// Runs and cleans up single unit steps.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    /// Runs a unit step and returns the output it produced.
    ///
    /// `outputs` holds the outputs of the steps that completed before this
    /// one. Errors from the underlying runner are returned unchanged.
    async fn run(
        &self,
        token: &Arc<CancellationToken>,
        step: &UnitStep,
        outputs: &StageOutput,
        account_id: &str,
    ) -> Result<StepOutput, EngineError>;

    /// Releases every resource held for a unit step.
    ///
    /// Called once per visited step, whether or not its body ran.
    async fn cleanup(&self, token: &Arc<CancellationToken>, step: &UnitStep) -> Result<(), EngineError>;

    /// Returns the attempt records of the latest run of a step.
    ///
    /// Executors that do not track attempts return nothing.
    fn attempts(&self, _step_id: &str) -> Vec<AttemptRecord> {
        Vec::new()
    }
}

/// Unit executor that runs steps as local processes.
///
/// Step files live in a directory of their own under
/// [`EngineConfig::tmp_file_path`], so executors sharing a temporary path
/// never see each other's files.
pub struct ProcessUnitExecutor {
    config: Arc<EngineConfig>,
    scope: String,
    resolver: Arc<dyn EntrypointResolver>,
    launcher: Arc<dyn ProcessLauncher>,
    sink: Arc<dyn OutputSink>,
    attempts: Mutex<HashMap<String, Vec<AttemptRecord>>>,
}

impl ProcessUnitExecutor {
    /// Creates an executor launching OS processes and logging their output.
    #[must_use]
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            scope: Uuid::new_v4().to_string(),
            resolver: Arc::new(StaticEntrypointResolver::new()),
            launcher: Arc::new(OsProcessLauncher),
            sink: Arc::new(TracingOutputSink),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the name of the directory holding this executor's step files.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets the plugin entrypoint resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn EntrypointResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the process launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Sets the sink receiving process output.
    #[must_use]
    pub fn with_output_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the directory holding this executor's step files.
    #[must_use]
    pub fn scope_dir(&self) -> PathBuf {
        self.config.tmp_file_path.join(&self.scope)
    }

    /// Returns the path of the output file used by a step.
    ///
    /// The name keeps a readable form of the id and a digest of the raw id,
    /// so distinct ids never share a file.
    #[must_use]
    pub fn output_file(&self, step_id: &str) -> PathBuf {
        let readable: String = step_id
            .chars()
            .take(48)
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let digest = Sha256::digest(step_id.as_bytes());
        self.scope_dir()
            .join(format!("{readable}-{}-output.env", hex::encode(&digest[..8])))
    }

    fn policy(&self, step: &UnitStep) -> ExecutionPolicy {
        ExecutionPolicy::resolve_with(
            step.limits(),
            self.config.default_timeout_secs,
            self.config.default_num_retries,
        )
    }

    async fn prepare_output_file(&self, step: &UnitStep) -> Result<Option<PathBuf>, EngineError> {
        let StepKind::Run(run) = &step.kind else {
            return Ok(None);
        };
        if run.output_vars.is_empty() {
            return Ok(None);
        }

        tokio::fs::create_dir_all(self.scope_dir()).await?;
        let path = self.output_file(&step.id);
        remove_if_exists(&path).await?;
        Ok(Some(path))
    }

    async fn collect_outputs(&self, step: &UnitStep, path: Option<PathBuf>) -> Result<StepOutput, EngineError> {
        let (Some(path), StepKind::Run(run)) = (path, &step.kind) else {
            return Ok(StepOutput::new());
        };

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(step_id = %step.id, path = %path.display(), "Step did not write its output file");
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        let exported = parse_output_vars(&content);
        let mut output = StepOutput::new();
        for var in &run.output_vars {
            match exported.get(var) {
                Some(value) => {
                    output.insert(var.clone(), value.clone());
                }
                None => warn!(step_id = %step.id, variable = %var, "Output variable not exported by step"),
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl UnitExecutor for ProcessUnitExecutor {
    async fn run(
        &self,
        token: &Arc<CancellationToken>,
        step: &UnitStep,
        outputs: &StageOutput,
        account_id: &str,
    ) -> Result<StepOutput, EngineError> {
        self.attempts.lock().remove(&step.id);
        let output_file = self.prepare_output_file(step).await?;

        let mut task = StepTask::new(
            step,
            self.policy(step),
            self.resolver.clone(),
            self.launcher.clone(),
            self.sink.clone(),
        )
        .with_outputs(outputs.clone());
        if let Some(path) = &output_file {
            task = task.with_env(OUTPUT_FILE_ENV, path.to_string_lossy());
        }

        let outcome = task.run(token).await;
        self.attempts.lock().insert(step.id.clone(), outcome.records.clone());
        let attempts = outcome.into_result()?;
        let output = self.collect_outputs(step, output_file).await?;

        info!(
            step_id = %step.id,
            kind = step.kind.name(),
            account_id = %account_id,
            attempts,
            output_vars = output.len(),
            "Unit step completed"
        );
        Ok(output)
    }

    async fn cleanup(&self, _token: &Arc<CancellationToken>, step: &UnitStep) -> Result<(), EngineError> {
        let path = self.output_file(&step.id);
        remove_if_exists(&path)
            .await
            .map_err(|e| EngineError::cleanup(&step.id, e.to_string()))?;
        // Only succeeds once the last step file is gone.
        let _ = tokio::fs::remove_dir(self.scope_dir()).await;
        debug!(step_id = %step.id, "Cleaned up unit step");
        Ok(())
    }

    fn attempts(&self, step_id: &str) -> Vec<AttemptRecord> {
        self.attempts.lock().get(step_id).cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for ProcessUnitExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessUnitExecutor")
            .field("scope_dir", &self.scope_dir())
            .field("launcher", &self.launcher)
            .finish()
    }
}

async fn remove_if_exists(path: &std::path::Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Parses `KEY=VALUE` lines written by a step.
///
/// Blank lines and `#` comments are ignored, a leading `export ` is
/// stripped, and the last assignment of a key wins.
pub(crate) fn parse_output_vars(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StepLimits;
    use crate::runner::BufferedOutputSink;
    use crate::testing::ScriptedLauncher;
    use pretty_assertions::assert_eq;

    fn executor(dir: &std::path::Path, launcher: Arc<ScriptedLauncher>) -> ProcessUnitExecutor {
        let config = Arc::new(EngineConfig::new().with_tmp_file_path(dir));
        ProcessUnitExecutor::new(config)
            .with_launcher(launcher)
            .with_output_sink(Arc::new(BufferedOutputSink::new()))
    }

    #[test]
    fn test_parse_output_vars() {
        let vars = parse_output_vars("# exported\nVERSION=1.0\nexport TAG = v1 \n\nBROKEN\n=nokey\n");
        assert_eq!(vars.len(), 2);
        assert_eq!(vars.get("VERSION").unwrap(), "1.0");
        assert_eq!(vars.get("TAG").unwrap(), "v1");
    }

    #[test]
    fn test_output_file_names_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), Arc::new(ScriptedLauncher::new())).with_scope("run-1");

        let paths: Vec<_> = ["x.y", "x_y", "x/y", "x y"]
            .iter()
            .map(|id| executor.output_file(id))
            .collect();

        for path in &paths {
            assert_eq!(path.parent().unwrap(), dir.path().join("run-1"));
            assert!(path.file_name().unwrap().to_string_lossy().starts_with("x_y-"));
        }
        let unique: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), paths.len());
    }

    #[test]
    fn test_executors_sharing_tmp_path_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let first = executor(dir.path(), Arc::new(ScriptedLauncher::new()));
        let second = executor(dir.path(), Arc::new(ScriptedLauncher::new()));

        assert_ne!(first.output_file("build"), second.output_file("build"));
        assert_eq!(first.output_file("build"), first.output_file("build"));
    }

    #[tokio::test]
    async fn test_attempts_recorded_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(ScriptedLauncher::new().with_exits([1, 0]));
        let executor = executor(dir.path(), launcher);
        let step = UnitStep::run("a", ["make"]).with_limits(StepLimits::new(5, 2));

        executor
            .run(&CancellationToken::new(), &step, &StageOutput::new(), "acct")
            .await
            .unwrap();

        let attempts = executor.attempts("a");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, crate::runner::AttemptOutcome::Failed);
        assert_eq!(attempts[1].outcome, crate::runner::AttemptOutcome::Succeeded);
        assert!(executor.attempts("other").is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_empty_output_without_vars() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(ScriptedLauncher::new());
        let executor = executor(dir.path(), launcher.clone());

        let output = executor
            .run(&CancellationToken::new(), &UnitStep::run("a", ["true"]), &StageOutput::new(), "acct")
            .await
            .unwrap();

        assert!(output.is_empty());
        assert!(launcher.last_command().unwrap().env.get(OUTPUT_FILE_ENV).is_none());
    }

    #[tokio::test]
    async fn test_run_propagates_runner_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(ScriptedLauncher::new().with_default_exit(7));
        let executor = executor(dir.path(), launcher.clone());
        let step = UnitStep::run("a", ["false"]).with_limits(StepLimits::new(5, 2));

        let err = executor
            .run(&CancellationToken::new(), &step, &StageOutput::new(), "acct")
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Execution { attempt: 2, exit_code: Some(7), .. }));
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_config_defaults_apply_to_unset_limits() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(ScriptedLauncher::new().with_default_exit(1));
        let config = Arc::new(
            EngineConfig::new()
                .with_tmp_file_path(dir.path())
                .with_default_num_retries(3),
        );
        let executor = ProcessUnitExecutor::new(config).with_launcher(launcher.clone());

        let _ = executor
            .run(&CancellationToken::new(), &UnitStep::run("a", ["false"]), &StageOutput::new(), "acct")
            .await;

        assert_eq!(launcher.launch_count(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_collects_declared_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(EngineConfig::new().with_tmp_file_path(dir.path()));
        let executor = ProcessUnitExecutor::new(config)
            .with_output_sink(Arc::new(BufferedOutputSink::new()));
        let step = UnitStep::run(
            "version",
            ["sh", "-c", "echo VERSION=2.1 >> $STEP_OUTPUT_FILE; echo SECRET=x >> $STEP_OUTPUT_FILE"],
        )
        .with_output_vars(["VERSION", "MISSING"]);

        let output = executor
            .run(&CancellationToken::new(), &step, &StageOutput::new(), "acct")
            .await
            .unwrap();

        assert_eq!(output.get("VERSION"), Some("2.1"));
        assert_eq!(output.get("SECRET"), None);
        assert_eq!(output.len(), 1);
        assert!(executor.output_file("version").exists());

        executor.cleanup(&CancellationToken::new(), &step).await.unwrap();
        assert!(!executor.output_file("version").exists());
        assert!(!executor.scope_dir().exists());
    }

    #[tokio::test]
    async fn test_cleanup_without_files_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), Arc::new(ScriptedLauncher::new()));

        let result = executor
            .cleanup(&CancellationToken::new(), &UnitStep::plugin("p", "plugins/s3"))
            .await;

        assert!(result.is_ok());
    }
}
