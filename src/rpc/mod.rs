//! Initiator/worker protocol.
//!
//! Newline-delimited JSON over any byte stream. Three frame shapes travel
//! on the channel:
//!
//! ```json
//! {"type":"request","id":1,"call":{"method":"handshake","protocol_version":1,"heartbeat_interval_ms":1000}}
//! {"type":"response","id":1,"outcome":{"status":"ok","reply":{"reply":"handshake","protocol_version":1,"worker_pid":4242}}}
//! {"type":"event","payload":{"kind":"heartbeat","seq":7}}
//! ```
//!
//! Requests carry an increasing correlation id, responses echo it, events
//! carry none and may arrive at any time. The initiator side lives in
//! [`client`]; the worker side is [`crate::remote::worker`].

pub mod client;
pub mod codec;
pub mod message;
pub mod pipe;

use thiserror::Error;

use crate::error::ErrorCategory;

pub use client::{CallObserver, IgnoreEvents, RpcClient};
pub use codec::{FrameReader, FrameWriter, MAX_FRAME_BYTES};
pub use message::{Call, Message, Outcome, Reply, RpcFault, WorkerEvent, PROTOCOL_VERSION};
pub use pipe::{pipe, PipeReader, PipeWriter};

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("worker closed the channel")]
    Disconnected,

    #[error("no heartbeat from worker for {silent_ms}ms (grace {grace_ms}ms)")]
    HeartbeatLost { silent_ms: u64, grace_ms: u64 },

    #[error("'{method}' did not complete before the deadline")]
    DeadlineExceeded { method: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("worker reported {category}: {message}")]
    Remote {
        category: ErrorCategory,
        message: String,
    },

    #[error("aborted: {0}")]
    Aborted(String),
}

impl RpcError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::Disconnected | Self::HeartbeatLost { .. } => ErrorCategory::Network,
            Self::DeadlineExceeded { .. } => ErrorCategory::Timeout,
            Self::Remote { category, .. } => *category,
            Self::Json(_)
            | Self::Malformed(_)
            | Self::FrameTooLarge { .. }
            | Self::Protocol(_)
            | Self::Aborted(_) => ErrorCategory::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let lost = RpcError::HeartbeatLost {
            silent_ms: 6000,
            grace_ms: 5000,
        };
        assert_eq!(lost.category(), ErrorCategory::Network);
        assert_eq!(
            RpcError::DeadlineExceeded {
                method: "start".into()
            }
            .category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            RpcError::Remote {
                category: ErrorCategory::Permission,
                message: "denied".into()
            }
            .category(),
            ErrorCategory::Permission
        );
        assert_eq!(RpcError::Disconnected.category(), ErrorCategory::Network);
    }
}
