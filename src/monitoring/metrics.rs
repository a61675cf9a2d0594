//! Step metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed row-count vocabulary every step reports in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowMetric {
    RowsRead,
    RowsWritten,
    RowsProcessed,
}

impl RowMetric {
    pub fn name(self) -> &'static str {
        match self {
            Self::RowsRead => "rows_read",
            Self::RowsWritten => "rows_written",
            Self::RowsProcessed => "rows_processed",
        }
    }
}

pub const STEP_DURATION: &str = "step_duration_ms";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub value: f64,
    pub unit: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            name: name.into(),
            value,
            unit: unit.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Row count for a step.
    pub fn rows(run_id: &str, step_id: &str, metric: RowMetric, count: u64) -> Self {
        Self::new(metric.name(), count as f64, "rows")
            .with_tag("run_id", run_id)
            .with_tag("step_id", step_id)
    }

    /// Wall-clock duration of a finished step.
    pub fn duration(run_id: &str, step_id: &str, duration_ms: u64) -> Self {
        Self::new(STEP_DURATION, duration_ms as f64, "ms")
            .with_tag("run_id", run_id)
            .with_tag("step_id", step_id)
    }

    pub fn step_id(&self) -> Option<&str> {
        self.tags.get("step_id").map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_metric_tags() {
        let metric = Metric::rows("run-1", "extract", RowMetric::RowsWritten, 1000);
        assert_eq!(metric.name, "rows_written");
        assert_eq!(metric.value, 1000.0);
        assert_eq!(metric.step_id(), Some("extract"));
        assert_eq!(metric.tags["run_id"], "run-1");
    }

    #[test]
    fn test_row_metric_serde_names() {
        assert_eq!(
            serde_json::to_string(&RowMetric::RowsProcessed).unwrap(),
            "\"rows_processed\""
        );
    }
}
