//! Step Execution Records
//!
//! One record per step, created `pending` when the run is prepared and
//! moved through `running` to a terminal state by the driving backend.
//! Terminal records never change again.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, StepError};
use crate::monitoring::{EventKind, RunEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Error recorded on a failed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
}

impl From<&StepError> for StepFailure {
    fn from(err: &StepError) -> Self {
        Self {
            category: err.category,
            message: err.message.clone(),
            upstream: err.upstream.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

impl StepRecord {
    pub fn pending(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            output_table: None,
            row_count: None,
            duration_ms: None,
            retries: 0,
            error: None,
        }
    }

    /// Returns false if the record is already terminal.
    pub fn mark_running(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = StepStatus::Running;
        true
    }

    pub fn mark_succeeded(
        &mut self,
        output_table: Option<String>,
        row_count: u64,
        duration_ms: u64,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = StepStatus::Succeeded;
        self.output_table = output_table;
        self.row_count = Some(row_count);
        self.duration_ms = Some(duration_ms);
        true
    }

    pub fn mark_failed(&mut self, failure: StepFailure, duration_ms: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = StepStatus::Failed;
        self.error = Some(failure);
        self.duration_ms = Some(duration_ms);
        true
    }

    /// Timing-free copy for comparing runs across backends.
    pub fn without_timing(&self) -> Self {
        Self {
            duration_ms: self.duration_ms.map(|_| 0),
            ..self.clone()
        }
    }
}

/// Whether a failure is attributed to a step or to the run itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    Step,
    Infrastructure,
    Timeout,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub scope: FailureScope,
    pub category: ErrorCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

impl FailureDetail {
    pub fn step(step_id: &str, failure: &StepFailure) -> Self {
        Self {
            scope: FailureScope::Step,
            category: failure.category,
            step_id: Some(step_id.to_string()),
            message: failure.message.clone(),
        }
    }

    pub fn infrastructure(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            scope: FailureScope::Infrastructure,
            category,
            step_id: None,
            message: message.into(),
        }
    }

    pub fn timeout(step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            scope: FailureScope::Timeout,
            category: ErrorCategory::Timeout,
            step_id: step_id.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            FailureScope::Step => "step",
            FailureScope::Infrastructure => "infrastructure",
            FailureScope::Timeout => "timeout",
        };
        match &self.step_id {
            Some(step) => write!(f, "{} failure in '{}' ({}): {}", scope, step, self.category, self.message),
            None => write!(f, "{} failure ({}): {}", scope, self.category, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failed => "failed",
        })
    }
}

/// What a backend hands back after `execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub records: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
}

impl RunReport {
    pub fn outcome(&self) -> RunOutcome {
        let all_done = self
            .records
            .iter()
            .all(|r| r.status == StepStatus::Succeeded);
        if self.failure.is_none() && all_done {
            RunOutcome::Success
        } else {
            RunOutcome::Failed
        }
    }

    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.records.iter().find(|r| r.step_id == step_id)
    }
}

/// Mutable set of records for one run, kept in plan order.
#[derive(Debug, Clone, Default)]
pub struct RecordBook {
    records: Vec<StepRecord>,
    index: HashMap<String, usize>,
}

impl RecordBook {
    pub fn new<'a>(step_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let records: Vec<StepRecord> = step_ids.into_iter().map(StepRecord::pending).collect();
        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.step_id.clone(), i))
            .collect();
        Self { records, index }
    }

    pub fn get(&self, step_id: &str) -> Option<&StepRecord> {
        self.index.get(step_id).map(|&i| &self.records[i])
    }

    fn get_mut(&mut self, step_id: &str) -> Option<&mut StepRecord> {
        let i = *self.index.get(step_id)?;
        self.records.get_mut(i)
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn start(&mut self, step_id: &str) {
        if let Some(r) = self.get_mut(step_id) {
            r.mark_running();
        }
    }

    pub fn note_retry(&mut self, step_id: &str) {
        if let Some(r) = self.get_mut(step_id) {
            if !r.status.is_terminal() {
                r.retries += 1;
            }
        }
    }

    pub fn succeed(&mut self, step_id: &str, output_table: Option<String>, row_count: u64, duration_ms: u64) {
        if let Some(r) = self.get_mut(step_id) {
            r.mark_succeeded(output_table, row_count, duration_ms);
        }
    }

    pub fn fail(&mut self, step_id: &str, failure: StepFailure, duration_ms: u64) {
        if let Some(r) = self.get_mut(step_id) {
            r.mark_failed(failure, duration_ms);
        }
    }

    /// Mirrors a step event into the records.
    pub fn apply(&mut self, event: &RunEvent) {
        let Some(step_id) = event.step_id.as_deref() else {
            return;
        };
        match &event.kind {
            EventKind::StepStarted => self.start(step_id),
            EventKind::StepRetrying { .. } => self.note_retry(step_id),
            EventKind::StepSucceeded {
                output_table,
                row_count,
                duration_ms,
            } => self.succeed(step_id, output_table.clone(), *row_count, *duration_ms),
            EventKind::StepFailed {
                category,
                message,
                duration_ms,
            } => self.fail(
                step_id,
                StepFailure {
                    category: *category,
                    message: message.clone(),
                    upstream: None,
                },
                *duration_ms,
            ),
            EventKind::RunStarted { .. } | EventKind::RunFinished { .. } => {}
        }
    }

    pub fn running(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.status == StepStatus::Running)
            .map(|r| r.step_id.as_str())
            .collect()
    }

    pub fn into_report(self, failure: Option<FailureDetail>) -> RunReport {
        RunReport {
            records: self.records,
            failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(category: ErrorCategory) -> StepFailure {
        StepFailure {
            category,
            message: "boom".into(),
            upstream: None,
        }
    }

    #[test]
    fn test_terminal_records_are_immutable() {
        let mut record = StepRecord::pending("a");
        assert!(record.mark_running());
        assert!(record.mark_succeeded(Some("a".into()), 10, 5));
        assert!(!record.mark_failed(failure(ErrorCategory::Unknown), 1));
        assert!(!record.mark_running());
        assert_eq!(record.status, StepStatus::Succeeded);
        assert_eq!(record.row_count, Some(10));
    }

    #[test]
    fn test_book_applies_events() {
        let mut book = RecordBook::new(["a", "b"]);
        book.apply(&RunEvent::step("r", "a", EventKind::StepStarted));
        book.apply(&RunEvent::step(
            "r",
            "a",
            EventKind::StepRetrying {
                attempt: 1,
                category: ErrorCategory::Network,
                delay_ms: 10,
            },
        ));
        book.apply(&RunEvent::step(
            "r",
            "a",
            EventKind::StepSucceeded {
                output_table: Some("a".into()),
                row_count: 3,
                duration_ms: 7,
            },
        ));
        book.apply(&RunEvent::step("r", "b", EventKind::StepStarted));

        let a = book.get("a").unwrap();
        assert_eq!(a.status, StepStatus::Succeeded);
        assert_eq!(a.retries, 1);
        assert_eq!(book.running(), vec!["b"]);
    }

    #[test]
    fn test_report_outcome() {
        let mut book = RecordBook::new(["a"]);
        book.start("a");
        book.succeed("a", None, 0, 1);
        assert_eq!(book.clone().into_report(None).outcome(), RunOutcome::Success);

        let failed = book.into_report(Some(FailureDetail::infrastructure(
            ErrorCategory::Network,
            "lost",
        )));
        assert_eq!(failed.outcome(), RunOutcome::Failed);

        let pending = RecordBook::new(["a"]).into_report(None);
        assert_eq!(pending.outcome(), RunOutcome::Failed);
    }

    #[test]
    fn test_failure_detail_display() {
        let detail = FailureDetail::step("extract", &failure(ErrorCategory::Validation));
        assert_eq!(
            detail.to_string(),
            "step failure in 'extract' (validation): boom"
        );
    }
}
