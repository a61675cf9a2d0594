//! Manifest Data Model
//!
//! A manifest is the compiled, ordered list of steps a run executes. Each
//! step names the implementation that performs it, carries an opaque
//! configuration map and lists the steps whose tables it reads.
//!
//! # Example YAML Format
//!
//! ```yaml
//! steps:
//!   - id: extract
//!     implementation: builtin.generate
//!     config:
//!       rows: 1000
//!
//!   - id: transform
//!     implementation: builtin.filter
//!     config:
//!       column: value
//!       op: gt
//!       value: 500
//!     depends_on: extract
//!
//!   - id: write
//!     implementation: builtin.export
//!     config:
//!       path: result.jsonl
//!     depends_on:
//!       - transform
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque per-step configuration. Steps parse it into their own typed structs.
pub type StepConfig = BTreeMap<String, Value>;

/// One step of a manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepSpec {
    /// Unique identifier, also the name of the step's output table
    pub id: String,

    /// Registered implementation that performs the step (e.g. `builtin.filter`)
    #[serde(alias = "implementation_ref")]
    pub implementation: String,

    #[serde(default)]
    pub config: StepConfig,

    /// Steps whose output tables this step reads
    #[serde(default, deserialize_with = "single_or_vec")]
    pub depends_on: Vec<String>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in depends_on list")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl StepSpec {
    /// Creates a step bound to an implementation.
    ///
    /// # Example
    ///
    /// ```
    /// use piperunner::manifest::StepSpec;
    ///
    /// let step = StepSpec::new("transform", "builtin.filter")
    ///     .with_config("column", "value")
    ///     .with_config("op", "gt")
    ///     .with_config("value", 500)
    ///     .depends_on("extract");
    /// assert_eq!(step.depends_on, vec!["extract"]);
    /// ```
    pub fn new(id: impl Into<String>, implementation: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            implementation: implementation.into().trim().to_string(),
            config: StepConfig::new(),
            depends_on: Vec::new(),
        }
    }

    /// Sets one configuration entry.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        let step_id = step_id.into();
        if !self.depends_on.contains(&step_id) {
            self.depends_on.push(step_id);
        }
        self
    }

    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }
}

/// Ordered collection of steps.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<StepSpec>) -> Self {
        Self { steps }
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Implementation references used by the manifest, deduplicated in order.
    pub fn implementations(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .map(|s| s.implementation.as_str())
            .filter(|i| seen.insert(*i))
            .collect()
    }
}
