//! Backend interface and the prepared run package.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::record::RunReport;
use super::retry::RetryPolicy;
use crate::error::EngineError;
use crate::manifest::StepSpec;
use crate::monitoring::EventSink;
use crate::redact::Redactor;

/// Which execution strategy runs the steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown backend '{}' (expected local or remote)", other)),
        }
    }
}

/// Execution settings that travel with the package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub batch_size: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<usize>,
}

/// Immutable package built once per run. Serialized as `run.json` when
/// shipped to a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedRun {
    pub run_id: String,
    /// Steps with their resolved configuration, in manifest order
    pub steps: Vec<StepSpec>,
    /// Dispatch order
    pub plan: Vec<String>,
    pub settings: RunSettings,
    /// Directory that receives the run's files. Local to each process.
    #[serde(skip)]
    pub run_dir: PathBuf,
}

impl PreparedRun {
    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Redactor seeded with every secret-named config value of the run.
    pub fn redactor(&self) -> Redactor {
        Redactor::from_configs(self.steps.iter().map(|s| &s.config))
    }

    pub fn with_run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = run_dir.into();
        self
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

/// An execution strategy. The coordinator always calls `teardown`, even
/// when an earlier phase failed.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Acquires the store (and sandbox) for the run.
    fn prepare(&mut self, run: &PreparedRun) -> Result<(), EngineError>;

    /// Runs every step in plan order and reports the records. Failures are
    /// part of the report, not an `Err`.
    fn execute(
        &mut self,
        run: &PreparedRun,
        sink: &dyn EventSink,
        deadline: Option<Instant>,
    ) -> RunReport;

    /// Places artifacts under the run directory and returns their paths
    /// relative to it.
    fn collect(&mut self, run: &PreparedRun) -> Result<Vec<PathBuf>, EngineError>;

    /// Releases everything acquired in `prepare`. Must be idempotent.
    fn teardown(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redact::REDACTED;

    fn package() -> PreparedRun {
        PreparedRun {
            run_id: "run-1".into(),
            steps: vec![
                StepSpec::new("extract", "builtin.generate").with_config("rows", 10),
                StepSpec::new("load", "example.load")
                    .with_config("api_token", "tok-12345")
                    .depends_on("extract"),
            ],
            plan: vec!["extract".into(), "load".into()],
            settings: RunSettings {
                batch_size: 100,
                retry: RetryPolicy::default(),
                timeout_ms: Some(1_000),
                cpu_limit: None,
            },
            run_dir: PathBuf::from("/tmp/run-1"),
        }
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Remote".parse::<BackendKind>().unwrap(), BackendKind::Remote);
        assert_eq!(BackendKind::default(), BackendKind::Local);
        assert!("cloud".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_package_json_skips_run_dir() {
        let run = package();
        let json = serde_json::to_string(&run).unwrap();
        assert!(!json.contains("/tmp/run-1"));

        let back: PreparedRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_dir, PathBuf::new());
        assert_eq!(back.with_run_dir("/tmp/run-1"), run);
    }

    #[test]
    fn test_redactor_from_package() {
        let run = package();
        let redactor = run.redactor();
        assert_eq!(
            redactor.redact("call failed with tok-12345"),
            format!("call failed with {}", REDACTED)
        );
        assert_eq!(run.step("load").unwrap().depends_on, vec!["extract"]);
        assert!(run.step("missing").is_none());
    }
}
