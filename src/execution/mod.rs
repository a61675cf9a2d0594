//! Run Execution
//!
//! Backends and the step loop they share.
//!
//! # Architecture
//!
//! - [`backend`]: the [`Backend`] trait and the [`PreparedRun`] package
//! - [`runner`]: sequential step loop with retries and deadline checks
//! - [`local`]: in-process backend
//! - [`record`]: step execution records and the run report
//! - [`retry`]: backoff policy for transient failures
//! - [`artifacts`]: run directory layout and table export

pub mod artifacts;
pub mod backend;
pub mod local;
pub mod record;
pub mod retry;
pub mod runner;

pub use backend::{Backend, BackendKind, PreparedRun, RunSettings};
pub use local::LocalBackend;
pub use record::{
    FailureDetail, FailureScope, RecordBook, RunOutcome, RunReport, StepFailure, StepRecord,
    StepStatus,
};
pub use retry::RetryPolicy;
pub use runner::StepRunner;
