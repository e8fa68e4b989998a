//! Decoded stage description: execution, steps, and step kinds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A decoded stage: the ordered steps to run for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Steps in declared order.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// The account (tenant) the stage runs for.
    #[serde(default)]
    pub account_id: String,
}

impl Execution {
    /// Creates an execution for an account.
    #[must_use]
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            account_id: account_id.into(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: impl Into<Step>) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Returns the number of unit steps, counting parallel members.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.steps.iter().map(Step::unit_count).sum()
    }
}

/// A step of a stage: either a single unit or a concurrent group of units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// A single unit of work.
    Unit(UnitStep),
    /// A group of units run concurrently.
    Parallel(ParallelStep),
}

impl Step {
    /// Returns the step id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Unit(unit) => &unit.id,
            Self::Parallel(group) => &group.id,
        }
    }

    /// Returns the step display name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self {
            Self::Unit(unit) => &unit.display_name,
            Self::Parallel(group) => &group.display_name,
        }
    }

    /// Returns the number of unit steps this step contains.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        match self {
            Self::Unit(_) => 1,
            Self::Parallel(group) => group.steps.len(),
        }
    }

    /// Returns a short label for the step type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Unit(_) => "unit",
            Self::Parallel(_) => "parallel",
        }
    }
}

impl From<UnitStep> for Step {
    fn from(step: UnitStep) -> Self {
        Self::Unit(step)
    }
}

impl From<ParallelStep> for Step {
    fn from(step: ParallelStep) -> Self {
        Self::Parallel(step)
    }
}

/// A single, independently executable piece of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStep {
    /// Identifier, unique within the stage.
    pub id: String,
    /// Human readable name.
    #[serde(default)]
    pub display_name: String,
    /// Kind-specific configuration.
    pub kind: StepKind,
}

impl UnitStep {
    /// Creates a unit step running an explicit command.
    #[must_use]
    pub fn run<I, S>(id: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind: StepKind::Run(RunStep::new(command)),
        }
    }

    /// Creates a unit step running a plugin image.
    #[must_use]
    pub fn plugin(id: impl Into<String>, image: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind: StepKind::Plugin(PluginStep::new(image)),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Sets the timeout and retry limits.
    #[must_use]
    pub fn with_limits(mut self, limits: StepLimits) -> Self {
        match &mut self.kind {
            StepKind::Run(run) => run.limits = limits,
            StepKind::Plugin(plugin) => plugin.limits = limits,
        }
        self
    }

    /// Declares output variables (only meaningful for run steps).
    #[must_use]
    pub fn with_output_vars<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let StepKind::Run(run) = &mut self.kind {
            run.output_vars = vars.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.kind {
            StepKind::Run(run) => run.env.insert(key.into(), value.into()),
            StepKind::Plugin(plugin) => plugin.env.insert(key.into(), value.into()),
        };
        self
    }

    /// Returns the configured limits.
    #[must_use]
    pub fn limits(&self) -> &StepLimits {
        match &self.kind {
            StepKind::Run(run) => &run.limits,
            StepKind::Plugin(plugin) => &plugin.limits,
        }
    }
}

/// A group of unit steps executed concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelStep {
    /// Identifier of the group.
    pub id: String,
    /// Human readable name.
    #[serde(default)]
    pub display_name: String,
    /// Member steps, no relative ordering guarantee.
    #[serde(default)]
    pub steps: Vec<UnitStep>,
}

impl ParallelStep {
    /// Creates an empty parallel group.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            steps: Vec::new(),
        }
    }

    /// Adds a member step.
    #[must_use]
    pub fn with_step(mut self, step: UnitStep) -> Self {
        self.steps.push(step);
        self
    }
}

/// Step-kind-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Run an explicit command.
    Run(RunStep),
    /// Run a plugin image's entrypoint.
    Plugin(PluginStep),
}

impl StepKind {
    /// Returns the kind name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Plugin(_) => "plugin",
        }
    }
}

/// Configuration of a step that runs an explicit command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStep {
    /// Program followed by its arguments.
    #[serde(default)]
    pub command: Vec<String>,
    /// Extra environment variables.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Output variables the command exports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_vars: Vec<String>,
    /// Timeout and retry limits.
    #[serde(default)]
    pub limits: StepLimits,
}

impl RunStep {
    /// Creates a run step configuration.
    #[must_use]
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Configuration of a step that runs a plugin image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStep {
    /// Plugin image reference.
    pub image: String,
    /// Extra environment variables.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Timeout and retry limits.
    #[serde(default)]
    pub limits: StepLimits,
}

impl PluginStep {
    /// Creates a plugin step configuration.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

/// Raw timeout and retry settings. Zero means "use the default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLimits {
    /// Per-attempt timeout in seconds.
    #[serde(default)]
    pub execution_timeout_secs: u64,
    /// Maximum number of attempts.
    #[serde(default)]
    pub num_retries: u32,
}

impl StepLimits {
    /// Creates limits with explicit values.
    #[must_use]
    pub fn new(execution_timeout_secs: u64, num_retries: u32) -> Self {
        Self {
            execution_timeout_secs,
            num_retries,
        }
    }
}
