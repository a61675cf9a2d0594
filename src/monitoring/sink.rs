//! Event and metric sinks.
//!
//! Steps and backends report through the [`EventSink`] trait. The run's
//! [`RunLog`] keeps everything in memory and, when given files, appends
//! each entry as one JSON line the moment it arrives.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::{log, warn, Level};

use super::events::RunEvent;
use super::metrics::Metric;

/// Destination for a run's events, metrics and step log lines.
pub trait EventSink: Send + Sync {
    fn event(&self, event: RunEvent);

    fn metric(&self, metric: Metric);

    /// Free-form log line from a step.
    fn log(&self, level: Level, message: &str) {
        log!(level, "{}", message);
    }
}

#[derive(Default)]
struct LogState {
    events: Vec<RunEvent>,
    metrics: Vec<Metric>,
    event_file: Option<BufWriter<File>>,
    metric_file: Option<BufWriter<File>>,
}

/// Thread-safe, append-only log of one run.
#[derive(Default)]
pub struct RunLog {
    state: Mutex<LogState>,
}

fn append_line<T: serde::Serialize>(file: &mut Option<BufWriter<File>>, entry: &T) {
    let Some(out) = file.as_mut() else {
        return;
    };
    let result = serde_json::to_writer(&mut *out, entry)
        .map_err(io::Error::from)
        .and_then(|_| out.write_all(b"\n"))
        .and_then(|_| out.flush());
    if let Err(e) = result {
        warn!("Failed to append to run log: {}", e);
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

impl RunLog {
    /// Log kept only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Log that also appends to `events.jsonl` and `metrics.jsonl` style files.
    pub fn with_files(events_path: &Path, metrics_path: &Path) -> io::Result<Self> {
        Ok(Self {
            state: Mutex::new(LogState {
                event_file: Some(open_append(events_path)?),
                metric_file: Some(open_append(metrics_path)?),
                ..LogState::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.state().events.clone()
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.state().metrics.clone()
    }

    /// Sum of a metric for one step.
    pub fn metric_total(&self, name: &str, step_id: &str) -> Option<f64> {
        let state = self.state();
        let values: Vec<f64> = state
            .metrics
            .iter()
            .filter(|m| m.name == name && m.step_id() == Some(step_id))
            .map(|m| m.value)
            .collect();
        (!values.is_empty()).then(|| values.iter().sum())
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut state = self.state();
        if let Some(f) = state.event_file.as_mut() {
            f.flush()?;
        }
        if let Some(f) = state.metric_file.as_mut() {
            f.flush()?;
        }
        Ok(())
    }
}

impl EventSink for RunLog {
    fn event(&self, event: RunEvent) {
        let mut state = self.state();
        append_line(&mut state.event_file, &event);
        state.events.push(event);
    }

    fn metric(&self, metric: Metric) {
        let mut state = self.state();
        append_line(&mut state.metric_file, &metric);
        state.metrics.push(metric);
    }
}
