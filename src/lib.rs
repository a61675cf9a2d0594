//! PipeRunner - Pipeline Execution Engine
//!
//! Runs a manifest of dependent steps against a shared SQLite table store,
//! either in the calling process or inside an isolated sandbox worker that is
//! driven over a line-delimited JSON protocol. Both backends produce the same
//! step records, events and artifacts for the same manifest.
//!
//! # Architecture
//!
//! - [`manifest`]: Step definitions, validation and dispatch order
//! - [`step`]: The step contract, execution context and built-in steps
//! - [`store`]: Per-run table store with ownership tracking
//! - [`execution`]: Backends, step records, retries and artifact export
//! - [`rpc`]: Wire protocol between the engine and a sandbox worker
//! - [`remote`]: Sandbox providers, the worker and the remote backend
//! - [`coordinator`]: End-to-end run orchestration and `status.json`
//! - [`monitoring`]: Events, metrics and resource sampling
//!
//! # Example
//!
//! ```rust,no_run
//! use piperunner::{load_manifest, EngineConfig, RunCoordinator, StepRegistry};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a manifest from YAML
//!     let manifest = load_manifest("pipeline.yaml")?;
//!
//!     // Run it on the configured backend
//!     let config = EngineConfig::from_env()?;
//!     let coordinator = RunCoordinator::new(config, StepRegistry::with_builtins());
//!     let status = coordinator.run(&manifest)?;
//!
//!     println!("{}", status.summary());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod execution;
pub mod manifest;
pub mod monitoring;
pub mod redact;
pub mod remote;
pub mod rpc;
pub mod step;
pub mod store;

// Re-export commonly used types
pub use config::EngineConfig;
pub use coordinator::{ConfigResolver, RunCoordinator, RunStatus};
pub use error::{EngineError, ErrorCategory, StepError};
pub use execution::{BackendKind, RunOutcome, StepStatus};
pub use manifest::{load_manifest, Manifest, StepSpec};
pub use step::{ExecutionContext, Step, StepRegistry};
pub use store::TableStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "PipeRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "PipeRunner");
    }

    #[test]
    fn test_module_exports_manifest() {
        let manifest = Manifest::new().with_step(StepSpec::new("extract", "builtin.generate"));
        assert_eq!(manifest.len(), 1);
        assert!(StepRegistry::with_builtins().contains("builtin.generate"));
    }
}
