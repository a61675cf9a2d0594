//! Final Run Status
//!
//! The aggregated result of one run, written to `status.json` in the run
//! directory once artifacts are collected.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::execution::{BackendKind, FailureDetail, RunOutcome, StepRecord, StepStatus};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunStatus {
    pub run_id: String,
    pub backend: BackendKind,
    pub status: RunOutcome,

    /// Why the run failed (absent on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,

    /// One record per step, in dispatch order
    pub steps: Vec<StepRecord>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Collected files, relative to the run directory
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

impl RunStatus {
    /// Writes the status as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("Saved run status to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunOutcome::Success
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Step ids by status.
    pub fn steps_with(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.step_id.as_str())
            .collect()
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        let succeeded = self.steps_with(StepStatus::Succeeded).len();
        let mut line = format!(
            "run {} {} on {} backend: {}/{} steps succeeded in {}ms",
            self.run_id,
            self.status,
            self.backend,
            succeeded,
            self.steps.len(),
            self.duration_ms
        );
        if let Some(failure) = &self.failure {
            line.push_str(&format!(" ({})", failure));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::execution::StepRecord;
    use tempfile::tempdir;

    fn status() -> RunStatus {
        let mut extract = StepRecord::pending("extract");
        extract.mark_running();
        extract.mark_succeeded(Some("extract".into()), 1000, 4);
        let now = Utc::now();
        RunStatus {
            run_id: "run-1".into(),
            backend: BackendKind::Local,
            status: RunOutcome::Failed,
            failure: Some(FailureDetail::infrastructure(ErrorCategory::Network, "worker lost")),
            steps: vec![extract, StepRecord::pending("write")],
            started_at: now,
            finished_at: now,
            duration_ms: 12,
            artifacts: vec![PathBuf::from("tables/extract.jsonl")],
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/status.json");
        let status = status();
        status.save(&path).unwrap();

        let loaded = RunStatus::load(&path).unwrap();
        assert_eq!(loaded, status);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failure"]["scope"], "infrastructure");
        assert_eq!(json["steps"][1]["status"], "pending");
    }

    #[test]
    fn test_summary_and_queries() {
        let status = status();
        assert!(!status.is_success());
        assert_eq!(status.steps_with(StepStatus::Pending), vec!["write"]);
        assert_eq!(status.step("extract").unwrap().row_count, Some(1000));
        let summary = status.summary();
        assert!(summary.contains("1/2 steps succeeded"));
        assert!(summary.contains("worker lost"));
    }
}
