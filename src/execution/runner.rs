//! Step Runner
//!
//! The sequential step loop shared by the local backend and the sandbox
//! worker. Both call [`StepRunner::run`] with the same package, which is
//! what keeps their event streams identical.
//!
//! Per step:
//! 1. Emit `step_started`
//! 2. Resolve the implementation and the upstream tables
//! 3. Validate the config and execute
//! 4. On a `network`/`timeout` failure, drop the step's partial tables and
//!    retry with backoff while the deadline allows
//! 5. Emit `step_succeeded` or `step_failed`; a failure stops the run
//!
//! A cancelled context stops dispatch the same way a passed deadline does.

use std::thread;
use std::time::Instant;

use log::{debug, error, info, warn};

use super::backend::PreparedRun;
use super::record::{FailureDetail, RecordBook, RunReport, StepFailure};
use super::retry::RetryPolicy;
use crate::error::{ErrorCategory, StepError};
use crate::manifest::StepSpec;
use crate::monitoring::{EventKind, Metric, RowMetric, RunEvent};
use crate::redact::Redactor;
use crate::step::{ExecutionContext, StepInputs};
use crate::store::TableRef;

/// What a successful attempt produced.
struct Completed {
    output_table: Option<String>,
    row_count: u64,
}

pub struct StepRunner<'r, 'c> {
    ctx: &'r ExecutionContext<'c>,
    retry: &'r RetryPolicy,
    redactor: &'r Redactor,
}

impl<'r, 'c> StepRunner<'r, 'c> {
    pub fn new(ctx: &'r ExecutionContext<'c>, retry: &'r RetryPolicy, redactor: &'r Redactor) -> Self {
        Self {
            ctx,
            retry,
            redactor,
        }
    }

    /// Runs the package's plan to completion or to the first failure.
    pub fn run(&self, run: &PreparedRun) -> RunReport {
        let mut book = RecordBook::new(run.plan.iter().map(String::as_str));
        let mut failure = None;

        for step_id in &run.plan {
            let Some(spec) = run.step(step_id) else {
                failure = Some(FailureDetail::infrastructure(
                    ErrorCategory::Unknown,
                    format!("planned step '{}' is missing from the package", step_id),
                ));
                break;
            };

            if self.ctx.cancelled() {
                warn!("Run cancelled before step '{}' started", step_id);
                failure = Some(FailureDetail::infrastructure(
                    ErrorCategory::Unknown,
                    "run aborted before all steps were dispatched",
                ));
                break;
            }

            if self.ctx.deadline_passed() {
                warn!("Run deadline passed before step '{}' started", step_id);
                failure = Some(FailureDetail::timeout(
                    Some(step_id),
                    "run deadline exceeded before the step started",
                ));
                break;
            }

            if let Err(detail) = self.run_step(spec, &mut book) {
                failure = Some(detail);
                break;
            }
        }

        book.into_report(failure)
    }

    fn emit(&self, step_id: &str, kind: EventKind) {
        self.ctx
            .sink()
            .event(RunEvent::step(self.ctx.run_id(), step_id, kind));
    }

    fn run_step(&self, spec: &StepSpec, book: &mut RecordBook) -> Result<(), FailureDetail> {
        let step_id = spec.id.as_str();
        info!("Starting step '{}' ({})", step_id, spec.implementation);
        book.start(step_id);
        self.emit(step_id, EventKind::StepStarted);

        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            let err = match self.attempt(spec) {
                Ok(done) => {
                    let duration_ms = elapsed_ms(started);
                    info!(
                        "Step '{}' succeeded: {} rows in {}ms",
                        step_id, done.row_count, duration_ms
                    );
                    book.succeed(step_id, done.output_table.clone(), done.row_count, duration_ms);
                    self.emit(
                        step_id,
                        EventKind::StepSucceeded {
                            output_table: done.output_table,
                            row_count: done.row_count,
                            duration_ms,
                        },
                    );
                    self.ctx
                        .sink()
                        .metric(Metric::duration(self.ctx.run_id(), step_id, duration_ms));
                    return Ok(());
                }
                Err(err) => err.map_message(|m| self.redactor.redact(m)),
            };

            if self.retry.should_retry(&err, retries)
                && self.retry_fits(retries)
                && !self.ctx.cancelled()
            {
                let delay_ms = self.retry.delay_ms(retries);
                retries += 1;
                warn!(
                    "Step '{}' failed ({}), retry {} in {}ms: {}",
                    step_id, err.category, retries, delay_ms, err.message
                );
                self.discard_partial(step_id);
                book.note_retry(step_id);
                self.emit(
                    step_id,
                    EventKind::StepRetrying {
                        attempt: retries,
                        category: err.category,
                        delay_ms,
                    },
                );
                thread::sleep(self.retry.delay(retries - 1));
                continue;
            }

            let duration_ms = elapsed_ms(started);
            error!("Step '{}' failed: {}", step_id, err);
            let failure = StepFailure::from(&err);
            book.fail(step_id, failure.clone(), duration_ms);
            self.emit(
                step_id,
                EventKind::StepFailed {
                    category: err.category,
                    message: err.message.clone(),
                    duration_ms,
                },
            );

            return Err(
                if err.category == ErrorCategory::Timeout && self.ctx.deadline_passed() {
                    FailureDetail::timeout(Some(step_id), err.message)
                } else {
                    FailureDetail::step(step_id, &failure)
                },
            );
        }
    }

    /// A retry is only started if it can begin before the deadline.
    fn retry_fits(&self, retries_done: u32) -> bool {
        match self.ctx.remaining() {
            Some(remaining) => remaining > self.retry.delay(retries_done),
            None => true,
        }
    }

    fn discard_partial(&self, step_id: &str) {
        match self.ctx.store().drop_owned(step_id) {
            Ok(dropped) if !dropped.is_empty() => {
                debug!("Dropped partial tables of '{}': {:?}", step_id, dropped)
            }
            Ok(_) => {}
            Err(e) => warn!("Could not drop partial tables of '{}': {}", step_id, e),
        }
        self.ctx.reset_rows(step_id);
    }

    fn attempt(&self, spec: &StepSpec) -> Result<Completed, StepError> {
        self.ctx.checkpoint()?;

        let step = self
            .ctx
            .registry()
            .resolve(&spec.implementation)
            .ok_or_else(|| {
                StepError::validation(format!(
                    "unknown implementation '{}'",
                    spec.implementation
                ))
            })?;

        let inputs = self.resolve_inputs(spec)?;
        step.validate_config(&spec.config)?;
        let outputs = step.execute(&spec.id, &spec.config, &inputs, self.ctx)?;

        let store = self.ctx.store();
        for (logical, table) in outputs.iter() {
            if store.owner_of(table.name()).as_deref() != Some(spec.id.as_str()) {
                return Err(StepError::validation(format!(
                    "output '{}' refers to table '{}', which step '{}' did not create",
                    logical,
                    table.name(),
                    spec.id
                )));
            }
        }

        match outputs.primary_table() {
            Some(table) => Ok(Completed {
                output_table: Some(table.name().to_string()),
                row_count: store.row_count(table.name())?,
            }),
            None => Ok(Completed {
                output_table: None,
                row_count: self.ctx.rows_reported(&spec.id, RowMetric::RowsWritten),
            }),
        }
    }

    /// Every dependency must have left a table under its own id.
    fn resolve_inputs(&self, spec: &StepSpec) -> Result<StepInputs, StepError> {
        let mut inputs = StepInputs::new();
        for upstream in &spec.depends_on {
            if !self.ctx.store().exists(upstream)? {
                return Err(StepError::missing_input(upstream));
            }
            inputs.insert(upstream.clone(), TableRef::new(upstream.clone()));
        }
        Ok(inputs)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
