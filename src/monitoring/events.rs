//! Run Events
//!
//! The append-only record of what happened during a run. Both backends
//! emit the same kinds in the same order for the same manifest; only the
//! timestamps and duration fields differ, which [`RunEvent::without_timing`]
//! strips for comparison.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;
use crate::execution::RunOutcome;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        step_count: usize,
    },
    StepStarted,
    StepRetrying {
        attempt: u32,
        category: ErrorCategory,
        delay_ms: u64,
    },
    StepSucceeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_table: Option<String>,
        row_count: u64,
        duration_ms: u64,
    },
    StepFailed {
        category: ErrorCategory,
        message: String,
        duration_ms: u64,
    },
    RunFinished {
        status: RunOutcome,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::StepStarted => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepSucceeded { .. } => "step_succeeded",
            Self::StepFailed { .. } => "step_failed",
            Self::RunFinished { .. } => "run_finished",
        }
    }
}

/// One entry of the run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: EventKind,
}

impl RunEvent {
    /// A run-level event.
    pub fn run(run_id: &str, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            step_id: None,
            kind,
        }
    }

    /// A step-level event.
    pub fn step(run_id: &str, step_id: &str, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            step_id: Some(step_id.to_string()),
            kind,
        }
    }

    /// Copy with timestamp and durations zeroed.
    pub fn without_timing(&self) -> Self {
        let kind = match &self.kind {
            EventKind::StepSucceeded {
                output_table,
                row_count,
                ..
            } => EventKind::StepSucceeded {
                output_table: output_table.clone(),
                row_count: *row_count,
                duration_ms: 0,
            },
            EventKind::StepFailed {
                category, message, ..
            } => EventKind::StepFailed {
                category: *category,
                message: message.clone(),
                duration_ms: 0,
            },
            EventKind::StepRetrying {
                attempt, category, ..
            } => EventKind::StepRetrying {
                attempt: *attempt,
                category: *category,
                delay_ms: 0,
            },
            other => other.clone(),
        };
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            run_id: self.run_id.clone(),
            step_id: self.step_id.clone(),
            kind,
        }
    }
}
