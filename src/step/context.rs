//! Execution Context
//!
//! The per-run object handed to every step: table store, event/metric
//! sink, step registry, working directory, batch size, the run deadline and
//! an optional cancellation flag raised when the run is aborted from outside.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::Level;

use super::registry::StepRegistry;
use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::StepError;
use crate::monitoring::{EventSink, Metric, RowMetric};
use crate::store::TableStore;

pub struct ExecutionContext<'a> {
    run_id: &'a str,
    store: &'a TableStore,
    sink: &'a dyn EventSink,
    registry: &'a StepRegistry,
    working_dir: &'a Path,
    batch_size: usize,
    deadline: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
    reported: RefCell<BTreeMap<(String, RowMetric), u64>>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        run_id: &'a str,
        store: &'a TableStore,
        sink: &'a dyn EventSink,
        registry: &'a StepRegistry,
        working_dir: &'a Path,
    ) -> Self {
        Self {
            run_id,
            store,
            sink,
            registry,
            working_dir,
            batch_size: DEFAULT_BATCH_SIZE,
            deadline: None,
            cancel: None,
            reported: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Once `flag` is set, no further step is dispatched and checkpoints fail.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn run_id(&self) -> &str {
        self.run_id
    }

    pub fn store(&self) -> &TableStore {
        self.store
    }

    pub fn sink(&self) -> &dyn EventSink {
        self.sink
    }

    pub fn registry(&self) -> &StepRegistry {
        self.registry
    }

    pub fn working_dir(&self) -> &Path {
        self.working_dir
    }

    /// Directory for files steps write (exports and the like).
    pub fn output_dir(&self) -> PathBuf {
        self.working_dir.join("outputs")
    }

    /// Rows per batch for streaming reads and writes.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Fails with a timeout once the run deadline has passed, or with an
    /// `unknown` error once the run was cancelled. Long-running steps call
    /// this between batches.
    pub fn checkpoint(&self) -> Result<(), StepError> {
        if self.cancelled() {
            return Err(StepError::unknown("run aborted"));
        }
        if self.deadline_passed() {
            return Err(StepError::timeout("run deadline exceeded"));
        }
        Ok(())
    }

    /// Reports a row count with the fixed metric vocabulary.
    pub fn record_rows(&self, step_id: &str, metric: RowMetric, count: u64) {
        *self
            .reported
            .borrow_mut()
            .entry((step_id.to_string(), metric))
            .or_insert(0) += count;
        self.sink
            .metric(Metric::rows(self.run_id, step_id, metric, count));
    }

    /// Total reported so far for a step.
    pub fn rows_reported(&self, step_id: &str, metric: RowMetric) -> u64 {
        self.reported
            .borrow()
            .get(&(step_id.to_string(), metric))
            .copied()
            .unwrap_or(0)
    }

    /// Forgets a step's row tallies (before a retry).
    pub fn reset_rows(&self, step_id: &str) {
        self.reported.borrow_mut().retain(|(s, _), _| s != step_id);
    }

    pub fn log(&self, level: Level, message: &str) {
        self.sink.log(level, message);
    }
}
