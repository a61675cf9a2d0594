//! Manifest Module
//!
//! The compiled description of a run: steps, their implementations,
//! opaque configuration and dependencies.
//!
//! # Submodules
//!
//! - [`model`]: `Manifest` and `StepSpec`
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: structural checks
//! - [`planner`]: deterministic topological order

pub mod model;
pub mod parser;
pub mod planner;
pub mod validator;

pub use model::{Manifest, StepConfig, StepSpec};
pub use parser::{load_manifest, parse_manifest, save_manifest};
pub use planner::ExecutionPlan;
pub use validator::{is_valid_step_id, validate_manifest, ManifestError};
