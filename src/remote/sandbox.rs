//! Sandboxes
//!
//! A sandbox is a private directory plus a worker started inside it. The
//! remote backend only talks to the worker through the [`Channel`] returned
//! by [`Sandbox::launch`], and only moves files in and out through
//! `upload`/`download`.
//!
//! Two providers exist:
//! - [`ProcessSandboxProvider`]: copies the worker binary into the sandbox
//!   and runs it as a child process with a cleared environment, using its
//!   stdin/stdout as the channel and `logs/worker.log` for stderr.
//! - [`ThreadSandboxProvider`]: runs the worker on a thread over in-memory
//!   pipes. Used for embedding and tests.

use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;

use super::worker::SandboxWorker;
use crate::error::ErrorCategory;
use crate::execution::artifacts::LOGS_DIR;
use crate::rpc::pipe;
use crate::step::StepRegistry;

/// Name of the worker binary inside a process sandbox.
const WORKER_BIN: &str = "piperunner";

pub const WORKER_LOG: &str = "worker.log";

/// Resolved once: the current executable if it is the engine binary, then
/// the engine binary next to it or one directory up (test harnesses run
/// from `deps/`), then `PATH`.
pub static WORKER_PROGRAM: Lazy<Option<PathBuf>> = Lazy::new(|| {
    let file_name = format!("{}{}", WORKER_BIN, env::consts::EXE_SUFFIX);

    if let Ok(exe) = env::current_exe() {
        if exe.file_stem().and_then(|s| s.to_str()) == Some(WORKER_BIN) {
            debug!("Using current executable as worker: {}", exe.display());
            return Some(exe);
        }
        if let Some(dir) = exe.parent() {
            for candidate in [dir.join(&file_name), dir.join("..").join(&file_name)] {
                if candidate.is_file() {
                    info!("Using worker binary: {}", candidate.display());
                    return Some(candidate);
                }
            }
        }
    }

    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                info!("Using worker binary from PATH: {}", candidate.display());
                return Some(candidate);
            }
        }
    }

    warn!("Worker binary '{}' not found", file_name);
    None
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub cpu_limit: usize,
    pub memory_limit_mb: u64,
    pub disk_limit_mb: u64,
}

/// Parameters for starting the worker.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec {
    pub heartbeat_interval: Duration,
}

/// Byte streams to and from the worker.
pub struct Channel {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("sandbox quota exhausted ({limit} in use)")]
    QuotaExhausted { limit: usize },

    #[error("worker binary not found: {0}")]
    WorkerNotFound(String),

    #[error("failed to launch worker: {0}")]
    LaunchFailed(String),

    #[error("path '{0}' escapes the sandbox")]
    PathEscape(PathBuf),

    #[error("worker was not launched")]
    NotLaunched,

    #[error("sandbox I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::QuotaExhausted { .. } => ErrorCategory::Permission,
            Self::WorkerNotFound(_) | Self::PathEscape(_) => ErrorCategory::Validation,
            Self::LaunchFailed(_) | Self::NotLaunched | Self::Io(_) => ErrorCategory::Unknown,
        }
    }
}

/// One allocated sandbox.
pub trait Sandbox: Send {
    fn id(&self) -> &str;

    fn root(&self) -> &Path;

    /// Writes a file at `relative` inside the sandbox.
    fn upload(&mut self, relative: &Path, contents: &[u8]) -> Result<(), SandboxError> {
        let target = resolve_inside(self.root(), relative)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, contents)?;
        Ok(())
    }

    /// Starts the worker and returns its channel.
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Channel, SandboxError>;

    /// Process id to sample for resource usage. `None` when there is no
    /// separate worker process to sample.
    fn worker_pid(&self) -> Option<u32>;

    fn is_running(&mut self) -> bool;

    /// Copies a sandbox file to `dest`.
    fn download(&self, relative: &Path, dest: &Path) -> Result<(), SandboxError> {
        let source = resolve_inside(self.root(), relative)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, dest)?;
        Ok(())
    }

    /// Bytes used under the sandbox root.
    fn disk_usage_bytes(&self) -> u64 {
        directory_size(self.root())
    }

    /// Stops the worker. Safe to call repeatedly.
    fn terminate(&mut self);

    /// Stops the worker and removes the sandbox directory.
    fn destroy(&mut self) -> Result<(), SandboxError>;
}

pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, run_id: &str) -> Result<Box<dyn Sandbox>, SandboxError>;
}

/// Joins `relative` onto `root`, refusing absolute paths and `..`.
pub fn resolve_inside(root: &Path, relative: &Path) -> Result<PathBuf, SandboxError> {
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return Err(SandboxError::PathEscape(relative.to_path_buf()));
    }
    Ok(root.join(relative))
}

pub fn directory_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Slot in a provider's concurrent sandbox quota. Released on drop.
struct QuotaSlot {
    active: Arc<AtomicUsize>,
}

impl QuotaSlot {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Result<Self, SandboxError> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .map_err(|_| SandboxError::QuotaExhausted { limit })?;
        Ok(Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for QuotaSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Directory part shared by both sandbox kinds.
struct SandboxDir {
    id: String,
    root: PathBuf,
    removed: bool,
    _slot: QuotaSlot,
}

impl SandboxDir {
    fn create(parent: &Path, run_id: &str, slot: QuotaSlot) -> Result<Self, SandboxError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", run_id, &suffix[..8]);
        let root = parent.join(&id);
        fs::create_dir_all(root.join(LOGS_DIR))?;
        debug!("Created sandbox {} at {}", id, root.display());
        Ok(Self {
            id,
            root,
            removed: false,
            _slot: slot,
        })
    }

    fn remove(&mut self) -> Result<(), SandboxError> {
        if !self.removed && self.root.exists() {
            fs::remove_dir_all(&self.root)?;
            debug!("Removed sandbox {}", self.id);
        }
        self.removed = true;
        Ok(())
    }
}

pub struct ProcessSandboxProvider {
    parent: PathBuf,
    max_sandboxes: usize,
    program: PathBuf,
    active: Arc<AtomicUsize>,
}

impl ProcessSandboxProvider {
    /// `program` overrides the resolved worker binary.
    pub fn new(
        parent: impl Into<PathBuf>,
        max_sandboxes: usize,
        program: Option<PathBuf>,
    ) -> Result<Self, SandboxError> {
        let program = match program {
            Some(p) if p.is_file() => p,
            Some(p) => return Err(SandboxError::WorkerNotFound(p.display().to_string())),
            None => WORKER_PROGRAM.clone().ok_or_else(|| {
                SandboxError::WorkerNotFound("searched next to the executable and PATH".into())
            })?,
        };
        Ok(Self {
            parent: parent.into(),
            max_sandboxes,
            program,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl SandboxProvider for ProcessSandboxProvider {
    fn name(&self) -> &'static str {
        "process"
    }

    fn create(&self, run_id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        let slot = QuotaSlot::acquire(&self.active, self.max_sandboxes)?;
        let dir = SandboxDir::create(&self.parent, run_id, slot)?;

        let bin_dir = dir.root.join("bin");
        fs::create_dir_all(&bin_dir)?;
        let worker = bin_dir.join(format!("{}{}", WORKER_BIN, env::consts::EXE_SUFFIX));
        fs::copy(&self.program, &worker)?;

        Ok(Box::new(ProcessSandbox {
            dir,
            worker,
            child: None,
        }))
    }
}

pub struct ProcessSandbox {
    dir: SandboxDir,
    worker: PathBuf,
    child: Option<Child>,
}

impl Sandbox for ProcessSandbox {
    fn id(&self) -> &str {
        &self.dir.id
    }

    fn root(&self) -> &Path {
        &self.dir.root
    }

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Channel, SandboxError> {
        let log = File::create(self.dir.root.join(LOGS_DIR).join(WORKER_LOG))?;

        let mut cmd = Command::new(&self.worker);
        cmd.arg("worker")
            .arg("--sandbox")
            .arg(&self.dir.root)
            .arg("--heartbeat-ms")
            .arg(spec.heartbeat_interval.as_millis().to_string())
            .current_dir(&self.dir.root)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log));
        if let Ok(level) = env::var("RUST_LOG") {
            cmd.env("RUST_LOG", level);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::LaunchFailed(format!("{}: {}", self.worker.display(), e)))?;
        let writer = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::LaunchFailed("worker stdin unavailable".into()))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::LaunchFailed("worker stdout unavailable".into()))?;

        info!("Launched worker pid {} in sandbox {}", child.id(), self.dir.id);
        self.child = Some(child);
        Ok(Channel {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    fn worker_pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                debug!("Killing worker pid {}", child.id());
                if let Err(e) = child.kill() {
                    warn!("Failed to kill worker: {}", e);
                }
            }
            let _ = child.wait();
        }
    }

    fn destroy(&mut self) -> Result<(), SandboxError> {
        self.terminate();
        self.dir.remove()
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        self.terminate();
    }
}

pub struct ThreadSandboxProvider {
    parent: PathBuf,
    max_sandboxes: usize,
    registry: StepRegistry,
    active: Arc<AtomicUsize>,
}

impl ThreadSandboxProvider {
    pub fn new(parent: impl Into<PathBuf>, max_sandboxes: usize, registry: StepRegistry) -> Self {
        Self {
            parent: parent.into(),
            max_sandboxes,
            registry,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SandboxProvider for ThreadSandboxProvider {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn create(&self, run_id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        let slot = QuotaSlot::acquire(&self.active, self.max_sandboxes)?;
        let dir = SandboxDir::create(&self.parent, run_id, slot)?;
        Ok(Box::new(ThreadSandbox {
            dir,
            registry: self.registry.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }))
    }
}

/// Worker on a thread. Termination is cooperative: the worker stops
/// sending frames at once and exits at its next request.
pub struct ThreadSandbox {
    dir: SandboxDir,
    registry: StepRegistry,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Sandbox for ThreadSandbox {
    fn id(&self) -> &str {
        &self.dir.id
    }

    fn root(&self) -> &Path {
        &self.dir.root
    }

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Channel, SandboxError> {
        let (request_tx, request_rx) = pipe::pipe();
        let (reply_tx, reply_rx) = pipe::pipe();

        let worker = SandboxWorker::new(&self.dir.root, self.registry.clone())
            .with_heartbeat_interval(spec.heartbeat_interval)
            .with_stop_flag(Arc::clone(&self.stop));
        let handle = thread::Builder::new()
            .name(format!("worker-{}", self.dir.id))
            .spawn(move || {
                if let Err(e) = worker.serve(request_rx, reply_tx) {
                    warn!("Worker ended with error: {}", e);
                }
            })
            .map_err(|e| SandboxError::LaunchFailed(e.to_string()))?;

        self.handle = Some(handle);
        Ok(Channel {
            reader: Box::new(reply_rx),
            writer: Box::new(request_tx),
        })
    }

    /// The worker shares the engine's process, so sampling it would
    /// measure the engine instead.
    fn worker_pid(&self) -> Option<u32> {
        None
    }

    fn is_running(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn terminate(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Detached; it exits once the initiator drops its end of the channel
        self.handle.take();
    }

    fn destroy(&mut self) -> Result<(), SandboxError> {
        self.terminate();
        self.dir.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_quota_is_enforced_and_released() {
        let dir = tempdir().unwrap();
        let provider = ThreadSandboxProvider::new(dir.path(), 1, StepRegistry::new());

        let mut first = provider.create("run-a").unwrap();
        let err = provider.create("run-b").err().unwrap();
        assert!(matches!(err, SandboxError::QuotaExhausted { limit: 1 }));
        assert_eq!(err.category(), ErrorCategory::Permission);

        first.destroy().unwrap();
        drop(first);
        assert!(provider.create("run-c").is_ok());
    }

    #[test]
    fn test_upload_download_and_escape() {
        let dir = tempdir().unwrap();
        let provider = ThreadSandboxProvider::new(dir.path().join("boxes"), 2, StepRegistry::new());
        let mut sandbox = provider.create("run").unwrap();

        sandbox.upload(Path::new("run.json"), b"{}").unwrap();
        assert!(sandbox.disk_usage_bytes() >= 2);

        let dest = dir.path().join("out/run.json");
        sandbox.download(Path::new("run.json"), &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"{}");

        let err = sandbox.upload(Path::new("../evil"), b"x").unwrap_err();
        assert!(matches!(err, SandboxError::PathEscape(_)));
        assert!(sandbox.download(Path::new("/etc/passwd"), &dest).is_err());

        let root = sandbox.root().to_path_buf();
        sandbox.destroy().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_thread_sandbox_has_no_worker_process() {
        let dir = tempdir().unwrap();
        let provider = ThreadSandboxProvider::new(dir.path(), 1, StepRegistry::new());
        let mut sandbox = provider.create("run").unwrap();
        assert!(!sandbox.is_running());

        let channel = sandbox
            .launch(&LaunchSpec {
                heartbeat_interval: Duration::from_millis(50),
            })
            .unwrap();
        assert!(sandbox.is_running());
        assert!(sandbox.worker_pid().is_none());

        sandbox.destroy().unwrap();
        assert!(!sandbox.is_running());
        drop(channel);
    }

    #[test]
    fn test_explicit_worker_must_exist() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("no-such-worker");
        let err = ProcessSandboxProvider::new(dir.path(), 1, Some(missing.clone()))
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::WorkerNotFound(p) if p == missing.display().to_string()));
    }

    #[test]
    fn test_process_sandbox_copies_worker() {
        let dir = tempdir().unwrap();
        let program = dir.path().join("fake-worker");
        fs::write(&program, b"#!/bin/sh\n").unwrap();
        let provider = ProcessSandboxProvider::new(dir.path().join("boxes"), 1, Some(program)).unwrap();

        let mut sandbox = provider.create("run").unwrap();
        let copied = sandbox
            .root()
            .join("bin")
            .join(format!("{}{}", WORKER_BIN, env::consts::EXE_SUFFIX));
        assert!(copied.is_file());
        assert!(sandbox.worker_pid().is_none());
        assert!(!sandbox.is_running());
        sandbox.destroy().unwrap();
    }
}
