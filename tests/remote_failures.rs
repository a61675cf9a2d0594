//! Remote backend failure handling: worker loss, disk limits, quota, run
//! timeout, and the real child-process sandbox.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use piperunner::config::{EngineConfig, SandboxKind};
use piperunner::execution::FailureScope;
use piperunner::manifest::StepConfig;
use piperunner::remote::{
    Channel, LaunchSpec, ProcessSandboxProvider, Sandbox, SandboxError, SandboxProvider,
    ThreadSandboxProvider,
};
use piperunner::step::{StepDescriptor, StepInputs, StepOutputs};
use piperunner::{
    BackendKind, ErrorCategory, ExecutionContext, Manifest, RunCoordinator, RunOutcome, Step,
    StepError, StepRegistry, StepSpec, StepStatus,
};
use tempfile::tempdir;

fn remote_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig {
        backend: BackendKind::Remote,
        working_dir: dir.to_path_buf(),
        ..EngineConfig::default()
    };
    config.sandbox.provider = SandboxKind::Thread;
    config.sandbox.root = Some(dir.join("sandboxes"));
    config.sandbox.heartbeat_interval_ms = 50;
    config.sandbox.heartbeat_grace_ms = 400;
    config
}

/// Drops everything the worker sends once `muted` is set.
struct MutedReader {
    inner: Box<dyn Read + Send>,
    muted: Arc<AtomicBool>,
}

impl Read for MutedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.inner.read(buf)?;
            if n == 0 || !self.muted.load(Ordering::SeqCst) {
                return Ok(n);
            }
        }
    }
}

/// Thread sandbox whose worker goes silent when a step asks it to.
struct SilentSandbox {
    inner: Box<dyn Sandbox>,
    muted: Arc<AtomicBool>,
}

impl Sandbox for SilentSandbox {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Channel, SandboxError> {
        let channel = self.inner.launch(spec)?;
        Ok(Channel {
            reader: Box::new(MutedReader {
                inner: channel.reader,
                muted: Arc::clone(&self.muted),
            }),
            writer: channel.writer,
        })
    }

    fn worker_pid(&self) -> Option<u32> {
        self.inner.worker_pid()
    }

    fn is_running(&mut self) -> bool {
        self.inner.is_running()
    }

    fn terminate(&mut self) {
        self.inner.terminate()
    }

    fn destroy(&mut self) -> Result<(), SandboxError> {
        self.inner.destroy()
    }
}

struct SilentProvider {
    inner: ThreadSandboxProvider,
    muted: Arc<AtomicBool>,
}

impl SandboxProvider for SilentProvider {
    fn name(&self) -> &'static str {
        "silent"
    }

    fn create(&self, run_id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        Ok(Box::new(SilentSandbox {
            inner: self.inner.create(run_id)?,
            muted: Arc::clone(&self.muted),
        }))
    }
}

/// Silences the worker channel, then keeps working for `hold`. The short
/// pause first lets `step_started` reach the initiator.
struct Freeze {
    muted: Arc<AtomicBool>,
    hold: Duration,
}

impl Step for Freeze {
    fn describe(&self) -> StepDescriptor {
        StepDescriptor::new("test.freeze", "silences the worker").sink()
    }

    fn execute(
        &self,
        _step_id: &str,
        _config: &StepConfig,
        _inputs: &StepInputs,
        _ctx: &ExecutionContext<'_>,
    ) -> Result<StepOutputs, StepError> {
        thread::sleep(Duration::from_millis(200));
        self.muted.store(true, Ordering::SeqCst);
        thread::sleep(self.hold);
        Ok(StepOutputs::none())
    }
}

/// Counts how often it is dispatched.
struct Counted {
    calls: Arc<AtomicU32>,
}

impl Step for Counted {
    fn describe(&self) -> StepDescriptor {
        StepDescriptor::new("test.counted", "counts its calls").sink()
    }

    fn execute(
        &self,
        _step_id: &str,
        _config: &StepConfig,
        _inputs: &StepInputs,
        _ctx: &ExecutionContext<'_>,
    ) -> Result<StepOutputs, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutputs::none())
    }
}

/// Writes a 2MB file into the run's outputs, then keeps working.
struct Hog;

impl Step for Hog {
    fn describe(&self) -> StepDescriptor {
        StepDescriptor::new("test.hog", "fills the sandbox disk").sink()
    }

    fn execute(
        &self,
        _step_id: &str,
        _config: &StepConfig,
        _inputs: &StepInputs,
        ctx: &ExecutionContext<'_>,
    ) -> Result<StepOutputs, StepError> {
        let dir = ctx.output_dir();
        fs::create_dir_all(&dir).map_err(|e| StepError::unknown(e.to_string()))?;
        fs::write(dir.join("hog.bin"), vec![0u8; 2 * 1024 * 1024])
            .map_err(|e| StepError::unknown(e.to_string()))?;
        thread::sleep(Duration::from_millis(1500));
        Ok(StepOutputs::none())
    }
}

#[test]
fn test_heartbeat_loss_fails_run_as_infrastructure() {
    let dir = tempdir().unwrap();
    let muted = Arc::new(AtomicBool::new(false));
    let mut registry = StepRegistry::with_builtins();
    registry
        .register(Freeze {
            muted: Arc::clone(&muted),
            hold: Duration::from_millis(3000),
        })
        .unwrap();

    let provider = SilentProvider {
        inner: ThreadSandboxProvider::new(dir.path().join("sandboxes"), 1, registry.clone()),
        muted,
    };
    let coordinator = RunCoordinator::new(remote_config(dir.path()), registry)
        .with_sandbox_provider(Arc::new(provider));

    let manifest = Manifest::new()
        .with_step(StepSpec::new("extract", "builtin.generate").with_config("rows", 10))
        .with_step(StepSpec::new("stall", "test.freeze").depends_on("extract"))
        .with_step(
            StepSpec::new("write", "builtin.export")
                .with_config("path", "out.jsonl")
                .depends_on("stall"),
        );
    let status = coordinator.run(&manifest).unwrap();

    assert_eq!(status.status, RunOutcome::Failed);
    let failure = status.failure.as_ref().unwrap();
    assert_eq!(failure.scope, FailureScope::Infrastructure);
    assert_eq!(failure.category, ErrorCategory::Network);
    assert!(failure.step_id.is_none());

    assert_eq!(status.step("extract").unwrap().status, StepStatus::Succeeded);
    let stall = status.step("stall").unwrap();
    assert_eq!(stall.status, StepStatus::Failed);
    assert_eq!(stall.error.as_ref().unwrap().category, ErrorCategory::Network);
    assert_eq!(status.step("write").unwrap().status, StepStatus::Pending);

    // The sandbox is destroyed even though the worker never answered again
    let sandboxes: Vec<_> = fs::read_dir(dir.path().join("sandboxes"))
        .unwrap()
        .collect();
    assert!(sandboxes.is_empty());
}

#[test]
fn test_lost_worker_dispatches_no_further_steps() {
    let dir = tempdir().unwrap();
    let muted = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = StepRegistry::with_builtins();
    registry
        .register(Freeze {
            muted: Arc::clone(&muted),
            hold: Duration::from_millis(1000),
        })
        .unwrap();
    registry
        .register(Counted {
            calls: Arc::clone(&calls),
        })
        .unwrap();

    let provider = SilentProvider {
        inner: ThreadSandboxProvider::new(dir.path().join("sandboxes"), 1, registry.clone()),
        muted,
    };
    let coordinator = RunCoordinator::new(remote_config(dir.path()), registry)
        .with_sandbox_provider(Arc::new(provider));

    let manifest = Manifest::new()
        .with_step(StepSpec::new("stall", "test.freeze"))
        .with_step(StepSpec::new("after", "test.counted"));
    let status = coordinator.run(&manifest).unwrap();

    assert_eq!(status.failure.as_ref().unwrap().scope, FailureScope::Infrastructure);
    assert_eq!(status.step("stall").unwrap().status, StepStatus::Failed);
    assert_eq!(status.step("after").unwrap().status, StepStatus::Pending);

    // Well past the point where the stalled step returns inside the worker
    thread::sleep(Duration::from_millis(1500));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_disk_limit_breach_fails_run_as_infrastructure() {
    let dir = tempdir().unwrap();
    let mut config = remote_config(dir.path());
    config.sandbox.disk_limit_mb = 1;
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = StepRegistry::with_builtins();
    registry.register(Hog).unwrap();
    registry
        .register(Counted {
            calls: Arc::clone(&calls),
        })
        .unwrap();
    let provider = ThreadSandboxProvider::new(dir.path().join("sandboxes"), 1, registry.clone());
    let coordinator =
        RunCoordinator::new(config, registry).with_sandbox_provider(Arc::new(provider));

    let manifest = Manifest::new()
        .with_step(StepSpec::new("extract", "builtin.generate").with_config("rows", 10))
        .with_step(StepSpec::new("hog", "test.hog"))
        .with_step(StepSpec::new("after", "test.counted"));
    let status = coordinator.run(&manifest).unwrap();

    assert_eq!(status.status, RunOutcome::Failed);
    let failure = status.failure.as_ref().unwrap();
    assert_eq!(failure.scope, FailureScope::Infrastructure);
    assert_eq!(failure.category, ErrorCategory::Unknown);
    assert!(failure.message.contains("disk usage"), "{}", failure.message);
    assert!(failure.message.contains("limit of 1.0MB"), "{}", failure.message);

    assert_eq!(status.step("extract").unwrap().status, StepStatus::Succeeded);
    let hog = status.step("hog").unwrap();
    assert_eq!(hog.status, StepStatus::Failed);
    assert_eq!(hog.error.as_ref().unwrap().category, ErrorCategory::Unknown);
    assert_eq!(status.step("after").unwrap().status, StepStatus::Pending);

    thread::sleep(Duration::from_millis(2000));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_run_timeout_on_remote_backend() {
    let dir = tempdir().unwrap();
    let mut config = remote_config(dir.path());
    config.run_timeout_secs = 1;
    let muted = Arc::new(AtomicBool::new(false));
    let mut registry = StepRegistry::with_builtins();
    registry
        .register(Freeze {
            muted: Arc::clone(&muted),
            hold: Duration::from_millis(3000),
        })
        .unwrap();
    // Heartbeats stay on, so only the deadline can end the call
    let provider = ThreadSandboxProvider::new(dir.path().join("sandboxes"), 1, registry.clone());
    let coordinator =
        RunCoordinator::new(config, registry).with_sandbox_provider(Arc::new(provider));

    let manifest = Manifest::new()
        .with_step(StepSpec::new("a", "test.freeze"))
        .with_step(StepSpec::new("b", "test.freeze").depends_on("a"));
    let status = coordinator.run(&manifest).unwrap();

    let failure = status.failure.as_ref().unwrap();
    assert_eq!(failure.scope, FailureScope::Timeout);
    assert_eq!(failure.category, ErrorCategory::Timeout);
    assert_eq!(status.step("b").unwrap().status, StepStatus::Pending);
}

#[test]
fn test_quota_shared_across_runs() {
    let dir = tempdir().unwrap();
    let provider: Arc<dyn SandboxProvider> = Arc::new(ThreadSandboxProvider::new(
        dir.path().join("sandboxes"),
        1,
        StepRegistry::with_builtins(),
    ));
    let coordinator = RunCoordinator::new(remote_config(dir.path()), StepRegistry::with_builtins())
        .with_sandbox_provider(Arc::clone(&provider));
    let manifest =
        Manifest::new().with_step(StepSpec::new("a", "builtin.generate").with_config("rows", 3));

    // Slot released after the first run's teardown
    assert!(coordinator.run(&manifest).unwrap().is_success());
    assert!(coordinator.run(&manifest).unwrap().is_success());

    let held = provider.create("held").unwrap();
    let status = coordinator.run(&manifest).unwrap();
    let failure = status.failure.as_ref().unwrap();
    assert_eq!(failure.scope, FailureScope::Infrastructure);
    assert_eq!(failure.category, ErrorCategory::Permission);
    assert_eq!(status.step("a").unwrap().status, StepStatus::Pending);
    drop(held);
}

#[test]
fn test_process_sandbox_runs_worker_binary() {
    let dir = tempdir().unwrap();
    let mut config = remote_config(dir.path());
    config.sandbox.provider = SandboxKind::Process;
    config.sandbox.heartbeat_interval_ms = 200;
    config.sandbox.heartbeat_grace_ms = 5000;
    config.sandbox.worker_program = Some(PathBuf::from(env!("CARGO_BIN_EXE_piperunner")));
    let provider = ProcessSandboxProvider::new(
        dir.path().join("sandboxes"),
        1,
        config.sandbox.worker_program.clone(),
    )
    .unwrap();
    assert!(provider.program().is_file());

    let coordinator = RunCoordinator::new(config, StepRegistry::with_builtins());
    let manifest = Manifest::new()
        .with_step(StepSpec::new("extract", "builtin.generate").with_config("rows", 1000))
        .with_step(
            StepSpec::new("transform", "builtin.filter")
                .with_config("column", "value")
                .with_config("op", "gt")
                .with_config("value", 500)
                .depends_on("extract"),
        );
    let status = coordinator.run(&manifest).unwrap();

    assert!(status.is_success(), "{}", status.summary());
    assert_eq!(status.step("transform").unwrap().row_count, Some(500));

    let run_dir = dir.path().join("runs").join(&status.run_id);
    assert!(run_dir.join("tables/transform.jsonl").is_file());
    assert!(run_dir.join("logs/worker.log").is_file());
    assert!(status.artifacts.contains(&PathBuf::from("logs/worker.log")));
}
