//! Wire types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;
use crate::execution::{PreparedRun, RunReport};
use crate::monitoring::{Metric, RunEvent};

/// Bumped on any incompatible change to the frames below.
pub const PROTOCOL_VERSION: u32 = 1;

/// One frame on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request { id: u64, call: Call },
    Response { id: u64, outcome: Outcome },
    Event { payload: WorkerEvent },
}

impl Message {
    pub fn ok(id: u64, reply: Reply) -> Self {
        Self::Response {
            id,
            outcome: Outcome::Ok { reply },
        }
    }

    pub fn error(id: u64, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            outcome: Outcome::Error {
                error: RpcFault {
                    category,
                    message: message.into(),
                },
            },
        }
    }

    pub fn event(payload: WorkerEvent) -> Self {
        Self::Event { payload }
    }
}

/// Methods the initiator can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    Handshake {
        protocol_version: u32,
        heartbeat_interval_ms: u64,
    },
    /// Runs the package. The reply arrives when the run is over.
    Start { package: Box<PreparedRun> },
    Collect,
    Shutdown,
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Start { .. } => "start",
            Self::Collect => "collect",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok { reply: Reply },
    Error { error: RpcFault },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    pub category: ErrorCategory,
    pub message: String,
}

/// Successful results. Only names, counts and statuses; never rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Handshake { protocol_version: u32, worker_pid: u32 },
    Completed { report: RunReport },
    /// Artifact paths relative to the sandbox root
    Collected { files: Vec<PathBuf> },
    Bye,
}

/// Unsolicited worker messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    Heartbeat { seq: u64 },
    Progress { event: RunEvent },
    Metric { metric: Metric },
    Log { level: String, message: String },
}
