//! Sandboxed remote execution.
//!
//! - [`sandbox`]: sandbox providers (child process or thread)
//! - [`worker`]: the protocol server that runs inside a sandbox
//! - [`backend`]: the initiator-side [`RemoteBackend`]

pub mod backend;
pub mod sandbox;
pub mod worker;

pub use backend::RemoteBackend;
pub use sandbox::{
    Channel, LaunchSpec, ProcessSandboxProvider, Sandbox, SandboxError, SandboxLimits,
    SandboxProvider, ThreadSandboxProvider, WORKER_PROGRAM,
};
pub use worker::SandboxWorker;
