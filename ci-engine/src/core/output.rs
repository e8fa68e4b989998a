//! Step and stage output stores.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Output variables produced by one unit step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepOutput {
    vars: HashMap<String, String>,
}

impl StepOutput {
    /// Creates an empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an output from a map of variables.
    #[must_use]
    pub fn from_vars(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    /// Adds a variable.
    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Inserts a variable, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.vars.insert(name.into(), value.into())
    }

    /// Gets a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Returns the number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns true if the step produced no variables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterates over the variables.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    /// Returns the underlying map.
    #[must_use]
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }
}

impl FromIterator<(String, String)> for StepOutput {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Outputs of every completed step in a stage run, keyed by step id.
///
/// Step ids are assumed unique; a later insert for the same id replaces the
/// earlier entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageOutput {
    steps: HashMap<String, StepOutput>,
}

impl StageOutput {
    /// Creates an empty stage output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the output of a step.
    pub fn insert(&mut self, step_id: impl Into<String>, output: StepOutput) {
        self.steps.insert(step_id.into(), output);
    }

    /// Merges the outputs of a joined parallel group.
    pub fn merge(&mut self, outputs: HashMap<String, StepOutput>) {
        self.steps.extend(outputs);
    }

    /// Gets the output of a step.
    #[must_use]
    pub fn get(&self, step_id: &str) -> Option<&StepOutput> {
        self.steps.get(step_id)
    }

    /// Looks up a single variable of a step.
    #[must_use]
    pub fn lookup(&self, step_id: &str, var: &str) -> Option<&str> {
        self.steps.get(step_id).and_then(|output| output.get(var))
    }

    /// Returns true if the step has recorded output.
    #[must_use]
    pub fn contains(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }

    /// Returns the number of recorded steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no step has recorded output.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the recorded step ids in sorted order.
    #[must_use]
    pub fn step_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.steps.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_output_vars() {
        let output = StepOutput::new().with_var("VERSION", "1.2.3");
        assert_eq!(output.get("VERSION"), Some("1.2.3"));
        assert_eq!(output.get("MISSING"), None);
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn test_stage_output_merge() {
        let mut stage = StageOutput::new();
        stage.insert("a", StepOutput::new().with_var("X", "1"));

        let mut group = HashMap::new();
        group.insert("b1".to_string(), StepOutput::new());
        group.insert("b2".to_string(), StepOutput::new().with_var("Y", "2"));
        stage.merge(group);

        assert_eq!(stage.step_ids(), vec!["a", "b1", "b2"]);
        assert_eq!(stage.lookup("b2", "Y"), Some("2"));
        assert_eq!(stage.lookup("a", "Y"), None);
    }

    #[test]
    fn test_stage_output_serializes_as_map() {
        let mut stage = StageOutput::new();
        stage.insert("build", StepOutput::new().with_var("ARTIFACT", "app.tar"));

        let json = serde_json::to_value(&stage).unwrap();
        assert_eq!(json, serde_json::json!({"build": {"ARTIFACT": "app.tar"}}));
    }
}
