//! Monitoring Module
//!
//! Run events, step metrics, the sinks that record them and process
//! resource sampling.
//!
//! # Components
//!
//! - [`RunEvent`]: lifecycle events written to `events.jsonl`
//! - [`Metric`]: row counts and durations written to `metrics.jsonl`
//! - [`EventSink`] / [`RunLog`]: where events and metrics go
//! - [`ResourceMonitor`]: CPU and memory sampling of a process

pub mod events;
pub mod metrics;
pub mod resource;
pub mod sink;

pub use events::{EventKind, RunEvent};
pub use metrics::{Metric, RowMetric, STEP_DURATION};
pub use resource::{ResourceMonitor, ResourceSample};
pub use sink::{EventSink, RunLog};
