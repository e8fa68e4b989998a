//! Resolution of step configurations into invocable commands.

use super::{has_references, interpolate, CommandSpec};
use crate::core::{StageOutput, StepKind};
use crate::errors::EngineError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::warn;

/// Looks up the entrypoint of a plugin image.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntrypointResolver: Send + Sync {
    /// Returns the command sequence the image runs.
    async fn entrypoint(&self, image: &str) -> anyhow::Result<Vec<String>>;
}

/// Resolves entrypoints from a fixed table.
#[derive(Debug, Default)]
pub struct StaticEntrypointResolver {
    entrypoints: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticEntrypointResolver {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the entrypoint of an image.
    #[must_use]
    pub fn with_entrypoint<I, S>(self, image: impl Into<String>, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register(image, entrypoint);
        self
    }

    /// Registers the entrypoint of an image.
    pub fn register<I, S>(&self, image: impl Into<String>, entrypoint: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoints
            .write()
            .insert(image.into(), entrypoint.into_iter().map(Into::into).collect());
    }
}

#[async_trait]
impl EntrypointResolver for StaticEntrypointResolver {
    async fn entrypoint(&self, image: &str) -> anyhow::Result<Vec<String>> {
        self.entrypoints
            .read()
            .get(image)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no entrypoint registered for image '{image}'"))
    }
}

/// Turns a step kind into the command to launch.
///
/// Arguments and environment values are interpolated against `outputs`.
/// Fails with [`EngineError::Resolution`] when a plugin image cannot be
/// resolved and with [`EngineError::EmptyCommand`] when the resolved
/// sequence is empty.
pub async fn resolve_command(
    step_id: &str,
    kind: &StepKind,
    resolver: &dyn EntrypointResolver,
    outputs: &StageOutput,
) -> Result<CommandSpec, EngineError> {
    let (argv, env) = match kind {
        StepKind::Run(run) => (run.command.clone(), &run.env),
        StepKind::Plugin(plugin) => {
            let argv = resolver
                .entrypoint(&plugin.image)
                .await
                .map_err(|e| EngineError::resolution(step_id, format!("{e:#}")))?;
            (argv, &plugin.env)
        }
    };

    if argv.is_empty() {
        return Err(EngineError::empty_command(step_id));
    }

    Ok(CommandSpec {
        argv: argv.iter().map(|arg| expand(step_id, arg, outputs)).collect(),
        env: env
            .iter()
            .map(|(k, v)| (k.clone(), expand(step_id, v, outputs)))
            .collect(),
    })
}

fn expand(step_id: &str, value: &str, outputs: &StageOutput) -> String {
    if !has_references(value) {
        return value.to_string();
    }
    let expanded = interpolate(value, outputs).into_owned();
    if has_references(&expanded) {
        warn!(step_id, value = %expanded, "Step output reference could not be resolved");
    }
    expanded
}
