//! Step Contract
//!
//! Every unit of work implements [`Step`]. A step receives the tables its
//! upstream steps produced ([`StepInputs`]), reads and writes rows directly
//! in the run's table store through the [`ExecutionContext`], and returns
//! the names of the tables it created ([`StepOutputs`]). Only table names
//! ever leave the step; the rows stay in the store.
//!
//! # Example
//!
//! ```rust,ignore
//! use piperunner::step::{Step, StepDescriptor, StepInputs, StepOutputs, ExecutionContext};
//!
//! struct CountStep;
//!
//! impl Step for CountStep {
//!     fn describe(&self) -> StepDescriptor {
//!         StepDescriptor::new("example.count", "Counts the rows of its input")
//!     }
//!
//!     fn execute(&self, step_id: &str, _config: &StepConfig, inputs: &StepInputs,
//!                ctx: &ExecutionContext<'_>) -> Result<StepOutputs, StepError> {
//!         let input = inputs.single(step_id)?;
//!         let sql = format!("SELECT COUNT(*) AS n FROM {}", quote_ident(input.name()));
//!         let table = ctx.store().create_table_as(step_id, step_id, &sql)?;
//!         Ok(StepOutputs::primary(table))
//!     }
//! }
//! ```

pub mod builtin;
pub mod context;
pub mod registry;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StepError;
use crate::manifest::StepConfig;
use crate::store::TableRef;

pub use context::ExecutionContext;
pub use registry::StepRegistry;

/// Logical name of a step's main output table.
pub const PRIMARY_OUTPUT: &str = "output";

/// The uniform interface of every unit of work.
pub trait Step: Send + Sync {
    /// Structured description used for discovery.
    fn describe(&self) -> StepDescriptor;

    /// Checks the configuration without touching any data.
    fn validate_config(&self, _config: &StepConfig) -> Result<(), StepError> {
        Ok(())
    }

    /// Reports whether the step could run with this configuration.
    fn check(&self, config: &StepConfig) -> HealthReport {
        let implementation = self.describe().implementation;
        let check = match self.validate_config(config) {
            Ok(()) => HealthCheck::passed("config"),
            Err(err) => HealthCheck::failed("config", err.to_string()),
        };
        HealthReport::new(implementation).with_check(check)
    }

    /// Runs the step. Must only write tables it creates during this call.
    fn execute(
        &self,
        step_id: &str,
        config: &StepConfig,
        inputs: &StepInputs,
        ctx: &ExecutionContext<'_>,
    ) -> Result<StepOutputs, StepError>;
}

/// Parses the opaque configuration into a step's typed config struct.
pub fn parse_config<T: DeserializeOwned>(
    implementation: &str,
    config: &StepConfig,
) -> Result<T, StepError> {
    let object: serde_json::Map<String, serde_json::Value> = config
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::from_value(serde_json::Value::Object(object)).map_err(|e| {
        StepError::validation(format!("invalid config for {}: {}", implementation, e))
    })
}

/// Table name for a step output. The primary output takes the step id.
pub fn output_table_name(step_id: &str, logical: &str) -> String {
    if logical == PRIMARY_OUTPUT {
        step_id.to_string()
    } else {
        format!("{}__{}", step_id, logical)
    }
}

/// Tables produced upstream, keyed by producing step id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInputs {
    tables: BTreeMap<String, TableRef>,
}

impl StepInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, table: TableRef) {
        self.tables.insert(name.into(), table);
    }

    pub fn get(&self, name: &str) -> Result<&TableRef, StepError> {
        self.tables
            .get(name)
            .ok_or_else(|| StepError::missing_input(name))
    }

    /// The only input. Fails when the step has none or several.
    pub fn single(&self, step_id: &str) -> Result<&TableRef, StepError> {
        let mut iter = self.tables.values();
        match (iter.next(), iter.next()) {
            (Some(table), None) => Ok(table),
            (None, _) => Err(StepError::validation(format!(
                "step '{}' needs exactly one input but has none",
                step_id
            ))),
            (Some(_), Some(_)) => Err(StepError::validation(format!(
                "step '{}' needs exactly one input but has {}; set 'input' in its config",
                step_id,
                self.tables.len()
            ))),
        }
    }

    /// The input named in config, or the only input.
    pub fn named_or_single(&self, step_id: &str, name: Option<&str>) -> Result<&TableRef, StepError> {
        match name {
            Some(name) => self.get(name),
            None => self.single(step_id),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TableRef)> {
        self.tables.iter()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Tables created by one step, keyed by logical name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutputs {
    tables: BTreeMap<String, TableRef>,
}

impl StepOutputs {
    /// A step that produced no table (sinks).
    pub fn none() -> Self {
        Self::default()
    }

    pub fn primary(table: TableRef) -> Self {
        Self::none().with(PRIMARY_OUTPUT, table)
    }

    pub fn with(mut self, logical: impl Into<String>, table: TableRef) -> Self {
        self.tables.insert(logical.into(), table);
        self
    }

    pub fn primary_table(&self) -> Option<&TableRef> {
        self.tables.get(PRIMARY_OUTPUT)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TableRef)> {
        self.tables.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// One configuration field in a step description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub kind: String,
    pub required: bool,
    pub description: String,
}

impl ConfigField {
    pub fn required(name: &str, kind: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: &str, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// Structured discovery output. Never carries configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub implementation: String,
    pub summary: String,
    pub config_fields: Vec<ConfigField>,
    pub produces_table: bool,
}

impl StepDescriptor {
    pub fn new(implementation: &str, summary: &str) -> Self {
        Self {
            implementation: implementation.to_string(),
            summary: summary.to_string(),
            config_fields: Vec::new(),
            produces_table: true,
        }
    }

    pub fn field(mut self, field: ConfigField) -> Self {
        self.config_fields.push(field);
        self
    }

    pub fn sink(mut self) -> Self {
        self.produces_table = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthCheck {
    pub fn passed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: None,
        }
    }

    pub fn failed(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

/// Result of [`Step::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub implementation: String,
    pub healthy: bool,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn new(implementation: impl Into<String>) -> Self {
        Self {
            implementation: implementation.into(),
            healthy: true,
            checks: Vec::new(),
        }
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.healthy &= check.passed;
        self.checks.push(check);
        self
    }
}
