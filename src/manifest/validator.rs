//! Manifest Validation
//!
//! Checks performed before a run is prepared:
//! - the manifest is not empty
//! - step ids are unique and usable as table names
//! - every step names an implementation
//! - every `depends_on` entry resolves to another step
//! - the dependency graph is acyclic (via [`super::planner::ExecutionPlan`])

use std::collections::HashSet;
use std::fmt;

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::model::{Manifest, StepSpec};
use super::planner::ExecutionPlan;

static STEP_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("step id pattern is valid"));

/// Validation error types for user-friendly error messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Manifest has no steps")]
    EmptyManifest,

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Invalid step ID '{0}': use letters, digits, '_' or '-', not starting with a digit")]
    InvalidStepId(String),

    #[error("Step '{0}' has no implementation specified")]
    EmptyImplementation(String),

    #[error("Step '{step}' depends on unknown step '{reference}'")]
    UnknownDependency { step: String, reference: String },

    #[error("Step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Manifest contains a dependency cycle among: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("{}", ErrorList(.0))]
    Multiple(Vec<ManifestError>),

    #[error("Failed to read manifest: {0}")]
    Io(String),

    #[error("Failed to parse manifest: {0}")]
    Parse(String),
}

struct ErrorList<'a>(&'a [ManifestError]);

impl fmt::Display for ErrorList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        f.write_str(&messages.join("\n"))
    }
}

pub fn is_valid_step_id(id: &str) -> bool {
    STEP_ID.is_match(id)
}

/// Validates a single step's fields.
fn validate_step(step: &StepSpec) -> Vec<ManifestError> {
    let mut errors = Vec::new();

    if !is_valid_step_id(&step.id) {
        errors.push(ManifestError::InvalidStepId(step.id.clone()));
        return errors; // Can't validate further without a usable ID
    }

    if step.implementation.trim().is_empty() {
        errors.push(ManifestError::EmptyImplementation(step.id.clone()));
    }

    if step.depends_on.iter().any(|d| d == &step.id) {
        errors.push(ManifestError::SelfDependency(step.id.clone()));
    }

    if step.is_root() {
        debug!("Step '{}' is a root step (no dependencies)", step.id);
    }

    errors
}

/// Validates the entire manifest structure.
///
/// Field and reference errors are collected and reported together; the
/// cycle check runs only once references are known to resolve.
pub fn validate_manifest(manifest: &Manifest) -> Result<ExecutionPlan, ManifestError> {
    info!("Validating manifest with {} steps", manifest.len());

    if manifest.is_empty() {
        return Err(ManifestError::EmptyManifest);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &manifest.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(ManifestError::DuplicateStepId(step.id.clone()));
        }
    }

    let mut all_errors = Vec::new();
    for step in &manifest.steps {
        all_errors.extend(validate_step(step));

        for dep in &step.depends_on {
            if dep != &step.id && !seen_ids.contains(dep.as_str()) {
                all_errors.push(ManifestError::UnknownDependency {
                    step: step.id.clone(),
                    reference: dep.clone(),
                });
            }
        }
    }

    match all_errors.len() {
        0 => {}
        1 => return Err(all_errors.remove(0)),
        _ => return Err(ManifestError::Multiple(all_errors)),
    }

    let plan = ExecutionPlan::build(manifest)?;
    info!("Manifest validated: {} steps", manifest.len());
    Ok(plan)
}
