//! Remote Backend
//!
//! Drives one sandbox per run:
//! - `prepare`: allocate the sandbox, upload `run.json`, launch the worker
//!   and handshake within the create timeout
//! - `execute`: send `start` and forward every worker event to the run's
//!   sink, unmodified and in order, while watching heartbeats, the run
//!   deadline, the worker's liveness and the sandbox's memory and disk usage
//! - `collect`: ask the worker to export, then download the files and the
//!   worker log
//! - `teardown`: shut the worker down and destroy the sandbox
//!
//! Losing the worker mid-run is an infrastructure failure of the run, not
//! a step failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn, Level};

use super::sandbox::{LaunchSpec, Sandbox, SandboxLimits, SandboxProvider, WORKER_LOG};
use crate::config::SandboxConfig;
use crate::error::{EngineError, ErrorCategory};
use crate::execution::artifacts::{LOGS_DIR, PACKAGE_FILE};
use crate::execution::{
    Backend, BackendKind, FailureDetail, PreparedRun, RecordBook, RunReport, StepFailure,
};
use crate::monitoring::{EventKind, EventSink, ResourceMonitor, RunEvent};
use crate::rpc::{
    Call, CallObserver, IgnoreEvents, Reply, RpcClient, RpcError, WorkerEvent, PROTOCOL_VERSION,
};

/// Minimum spacing of sandbox disk scans.
const DISK_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Sizes under a megabyte keep their precision in breach messages.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Mirrors worker events into the run's sink and records, and enforces the
/// sandbox limits on every tick.
struct ForwardingObserver<'a> {
    sink: &'a dyn EventSink,
    sandbox: &'a mut dyn Sandbox,
    book: RecordBook,
    started: HashMap<String, Instant>,
    monitor: Option<ResourceMonitor>,
    limits: SandboxLimits,
    last_disk_check: Option<Instant>,
    breach: Option<String>,
}

impl ForwardingObserver<'_> {
    fn check_limits(&mut self) -> Option<String> {
        if let Some(sample) = self.monitor.as_mut().and_then(|m| m.sample()) {
            if sample.memory_mb > self.limits.memory_limit_mb {
                return Some(format!(
                    "sandbox memory {}MB exceeds limit of {}MB",
                    sample.memory_mb, self.limits.memory_limit_mb
                ));
            }
        }

        let due = self
            .last_disk_check
            .map_or(true, |t| t.elapsed() >= DISK_CHECK_INTERVAL);
        if due {
            self.last_disk_check = Some(Instant::now());
            let used = self.sandbox.disk_usage_bytes();
            let limit = self.limits.disk_limit_mb.saturating_mul(1024 * 1024);
            if used > limit {
                return Some(format!(
                    "sandbox disk usage {} exceeds limit of {}",
                    format_bytes(used),
                    format_bytes(limit)
                ));
            }
        }
        None
    }
}

impl CallObserver for ForwardingObserver<'_> {
    fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Heartbeat { seq } => trace!("heartbeat {}", seq),
            WorkerEvent::Progress { event } => {
                if let (Some(step_id), EventKind::StepStarted) = (&event.step_id, &event.kind) {
                    self.started.insert(step_id.clone(), Instant::now());
                }
                self.book.apply(&event);
                self.sink.event(event);
            }
            WorkerEvent::Metric { metric } => self.sink.metric(metric),
            WorkerEvent::Log { level, message } => {
                let level = level.parse::<Level>().unwrap_or(Level::Info);
                self.sink.log(level, &message);
            }
        }
    }

    fn on_tick(&mut self) -> Result<(), RpcError> {
        if !self.sandbox.is_running() {
            return Err(RpcError::Disconnected);
        }
        if let Some(breach) = self.check_limits() {
            self.breach = Some(breach.clone());
            return Err(RpcError::Aborted(breach));
        }
        Ok(())
    }
}

pub struct RemoteBackend {
    provider: Arc<dyn SandboxProvider>,
    limits: SandboxLimits,
    heartbeat_interval: Duration,
    heartbeat_grace: Duration,
    create_timeout: Duration,
    sandbox: Option<Box<dyn Sandbox>>,
    client: Option<RpcClient>,
    worker_alive: bool,
}

impl RemoteBackend {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: &SandboxConfig) -> Self {
        Self {
            provider,
            limits: config.limits(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_grace: config.heartbeat_grace(),
            create_timeout: config.create_timeout(),
            sandbox: None,
            client: None,
            worker_alive: false,
        }
    }

    pub fn sandbox_root(&self) -> Option<&Path> {
        self.sandbox.as_deref().map(|s| s.root())
    }

    fn handshake(&mut self, client: &mut RpcClient) -> Result<u32, EngineError> {
        let deadline = Instant::now() + self.create_timeout;
        let call = Call::Handshake {
            protocol_version: PROTOCOL_VERSION,
            heartbeat_interval_ms: self.heartbeat_interval.as_millis() as u64,
        };
        match client.call(call, Some(deadline), &mut IgnoreEvents)? {
            Reply::Handshake {
                protocol_version,
                worker_pid,
            } if protocol_version == PROTOCOL_VERSION => Ok(worker_pid),
            Reply::Handshake {
                protocol_version, ..
            } => Err(RpcError::Protocol(format!(
                "worker speaks protocol {}, expected {}",
                protocol_version, PROTOCOL_VERSION
            ))
            .into()),
            other => Err(unexpected("handshake", &other).into()),
        }
    }

    /// Ends the call-in-flight failure: stops the worker if it is gone or
    /// must be stopped, and fails the steps that were running.
    fn abort(
        &mut self,
        run: &PreparedRun,
        sink: &dyn EventSink,
        mut book: RecordBook,
        started: HashMap<String, Instant>,
        breach: Option<String>,
        err: RpcError,
    ) -> RunReport {
        let redactor = run.redactor();
        let running: Vec<String> = book.running().iter().map(|s| s.to_string()).collect();

        let (detail, step_category) = match (breach, &err) {
            (Some(breach), _) => (
                FailureDetail::infrastructure(ErrorCategory::Unknown, breach),
                ErrorCategory::Unknown,
            ),
            (None, RpcError::DeadlineExceeded { .. }) => (
                FailureDetail::timeout(running.first().map(String::as_str), "run timeout exceeded"),
                ErrorCategory::Timeout,
            ),
            (None, err) => (
                FailureDetail::infrastructure(
                    err.category(),
                    redactor.redact(&format!("worker failed: {}", err)),
                ),
                err.category(),
            ),
        };
        error!("Remote run {} aborted: {}", run.run_id, detail);

        let stop_worker = !matches!(err, RpcError::Remote { .. });
        if stop_worker {
            self.worker_alive = false;
            if let Some(sandbox) = self.sandbox.as_mut() {
                sandbox.terminate();
            }
        }

        for step_id in running {
            let duration_ms = started
                .get(&step_id)
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);
            let failure = StepFailure {
                category: step_category,
                message: detail.message.clone(),
                upstream: None,
            };
            book.fail(&step_id, failure, duration_ms);
            sink.event(RunEvent::step(
                &run.run_id,
                &step_id,
                EventKind::StepFailed {
                    category: step_category,
                    message: detail.message.clone(),
                    duration_ms,
                },
            ));
        }

        book.into_report(Some(detail))
    }
}

fn unexpected(method: &str, reply: &Reply) -> RpcError {
    RpcError::Protocol(format!("unexpected reply to {}: {:?}", method, reply))
}

impl Backend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn prepare(&mut self, run: &PreparedRun) -> Result<(), EngineError> {
        let mut sandbox = self.provider.create(&run.run_id)?;
        info!(
            "Allocated {} sandbox {} for run {}",
            self.provider.name(),
            sandbox.id(),
            run.run_id
        );

        let package = serde_json::to_vec_pretty(run)?;
        sandbox.upload(Path::new(PACKAGE_FILE), &package)?;
        let channel = sandbox.launch(&LaunchSpec {
            heartbeat_interval: self.heartbeat_interval,
        })?;
        // Owned before the handshake so teardown can always reach it
        self.sandbox = Some(sandbox);

        let mut client = RpcClient::connect(channel.reader, channel.writer, self.heartbeat_grace)?;
        let worker_pid = self.handshake(&mut client)?;
        match self.sandbox.as_deref().and_then(|s| s.worker_pid()) {
            Some(pid) if pid != worker_pid => warn!(
                "Worker reports pid {} but the sandbox launched pid {}",
                worker_pid, pid
            ),
            Some(_) => debug!("Handshake complete with worker pid {}", worker_pid),
            None => debug!("Handshake complete with in-process worker"),
        }

        self.client = Some(client);
        self.worker_alive = true;
        Ok(())
    }

    fn execute(
        &mut self,
        run: &PreparedRun,
        sink: &dyn EventSink,
        deadline: Option<Instant>,
    ) -> RunReport {
        let book = RecordBook::new(run.plan.iter().map(String::as_str));
        let (Some(client), Some(sandbox)) = (self.client.as_mut(), self.sandbox.as_deref_mut())
        else {
            return book.into_report(Some(FailureDetail::infrastructure(
                ErrorCategory::Unknown,
                EngineError::NotPrepared.to_string(),
            )));
        };

        let monitor = sandbox.worker_pid().map(ResourceMonitor::for_process);
        if monitor.is_none() {
            debug!("No worker process to sample for run {}", run.run_id);
        }
        let mut observer = ForwardingObserver {
            sink,
            sandbox,
            book,
            started: HashMap::new(),
            monitor,
            limits: self.limits,
            last_disk_check: None,
            breach: None,
        };
        let call = Call::Start {
            package: Box::new(run.clone()),
        };
        let result = client.call(call, deadline, &mut observer);

        let ForwardingObserver {
            book,
            started,
            breach,
            monitor,
            ..
        } = observer;
        if let Some(monitor) = monitor {
            debug!("Sandbox usage for run {}: {}", run.run_id, monitor.usage_summary());
        }
        match result {
            Ok(Reply::Completed { report }) => report,
            Ok(other) => self.abort(run, sink, book, started, None, unexpected("start", &other)),
            Err(err) => self.abort(run, sink, book, started, breach, err),
        }
    }

    fn collect(&mut self, run: &PreparedRun) -> Result<Vec<PathBuf>, EngineError> {
        let mut files = Vec::new();

        if self.worker_alive {
            if let Some(client) = self.client.as_mut() {
                let deadline = Instant::now() + self.create_timeout;
                match client.call(Call::Collect, Some(deadline), &mut IgnoreEvents) {
                    Ok(Reply::Collected { files: remote }) => files = remote,
                    Ok(other) => return Err(unexpected("collect", &other).into()),
                    Err(RpcError::Remote { message, .. }) => {
                        warn!("Worker had nothing to collect: {}", message)
                    }
                    Err(e) => {
                        self.worker_alive = false;
                        return Err(e.into());
                    }
                }
            }
        }

        let sandbox = self.sandbox.as_deref().ok_or(EngineError::NotPrepared)?;
        for file in &files {
            sandbox.download(file, &run.run_dir().join(file))?;
        }

        let log = Path::new(LOGS_DIR).join(WORKER_LOG);
        if sandbox.root().join(&log).is_file() {
            sandbox.download(&log, &run.run_dir().join(&log))?;
            files.push(log);
        }

        info!("Downloaded {} artifact(s) from sandbox {}", files.len(), sandbox.id());
        Ok(files)
    }

    fn teardown(&mut self) {
        if let Some(mut client) = self.client.take() {
            if self.worker_alive {
                let deadline = Instant::now() + self.heartbeat_grace;
                if let Err(e) = client.call(Call::Shutdown, Some(deadline), &mut IgnoreEvents) {
                    debug!("Worker shutdown failed: {}", e);
                }
            }
        }
        self.worker_alive = false;

        if let Some(mut sandbox) = self.sandbox.take() {
            sandbox.terminate();
            match sandbox.destroy() {
                Ok(()) => debug!("Destroyed sandbox {}", sandbox.id()),
                Err(e) => warn!("Failed to destroy sandbox {}: {}", sandbox.id(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxKind;
    use crate::execution::{FailureScope, RetryPolicy, RunOutcome, RunSettings};
    use crate::manifest::StepSpec;
    use crate::monitoring::RunLog;
    use crate::remote::sandbox::{Channel, SandboxError};
    use crate::remote::ThreadSandboxProvider;
    use crate::step::StepRegistry;
    use tempfile::tempdir;

    fn config() -> SandboxConfig {
        SandboxConfig {
            provider: SandboxKind::Thread,
            heartbeat_interval_ms: 20,
            heartbeat_grace_ms: 1_000,
            create_timeout_secs: 5,
            ..SandboxConfig::default()
        }
    }

    fn package(run_dir: PathBuf) -> PreparedRun {
        let steps = vec![
            StepSpec::new("extract", "builtin.generate").with_config("rows", 40),
            StepSpec::new("write", "builtin.export")
                .with_config("path", "rows.jsonl")
                .depends_on("extract"),
        ];
        PreparedRun {
            run_id: "remote-test".into(),
            plan: steps.iter().map(|s| s.id.clone()).collect(),
            steps,
            settings: RunSettings {
                batch_size: 16,
                retry: RetryPolicy::none(),
                timeout_ms: None,
                cpu_limit: Some(2),
            },
            run_dir,
        }
    }

    #[test]
    fn test_thread_sandbox_lifecycle() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(ThreadSandboxProvider::new(
            dir.path().join("sandboxes"),
            1,
            StepRegistry::with_builtins(),
        ));
        let mut backend = RemoteBackend::new(provider, &config());
        let run = package(dir.path().join("run"));

        backend.prepare(&run).unwrap();
        let root = backend.sandbox_root().unwrap().to_path_buf();
        assert!(root.join(PACKAGE_FILE).is_file());

        let log = RunLog::in_memory();
        let report = backend.execute(&run, &log, None);
        assert_eq!(report.outcome(), RunOutcome::Success);
        assert_eq!(report.record("extract").unwrap().row_count, Some(40));
        assert_eq!(log.events().len(), 4);

        let files = backend.collect(&run).unwrap();
        assert!(files.contains(&PathBuf::from("tables/extract.jsonl")));
        assert!(files.contains(&PathBuf::from("outputs/rows.jsonl")));
        assert!(run.run_dir().join("outputs/rows.jsonl").is_file());

        backend.teardown();
        assert!(!root.exists());
        backend.teardown();
    }

    #[test]
    fn test_execute_before_prepare() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(ThreadSandboxProvider::new(
            dir.path(),
            1,
            StepRegistry::with_builtins(),
        ));
        let mut backend = RemoteBackend::new(provider, &config());
        let report = backend.execute(&package(dir.path().join("run")), &RunLog::in_memory(), None);
        assert_eq!(report.outcome(), RunOutcome::Failed);
        assert!(report.failure.is_some());
    }

    /// Thread sandbox that reports its worker as exited from the start.
    struct ExitedSandbox(Box<dyn Sandbox>);

    impl Sandbox for ExitedSandbox {
        fn id(&self) -> &str {
            self.0.id()
        }

        fn root(&self) -> &Path {
            self.0.root()
        }

        fn launch(&mut self, spec: &LaunchSpec) -> Result<Channel, SandboxError> {
            self.0.launch(spec)
        }

        fn worker_pid(&self) -> Option<u32> {
            None
        }

        fn is_running(&mut self) -> bool {
            false
        }

        fn terminate(&mut self) {
            self.0.terminate()
        }

        fn destroy(&mut self) -> Result<(), SandboxError> {
            self.0.destroy()
        }
    }

    struct ExitedProvider(ThreadSandboxProvider);

    impl SandboxProvider for ExitedProvider {
        fn name(&self) -> &'static str {
            "exited"
        }

        fn create(&self, run_id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
            Ok(Box::new(ExitedSandbox(self.0.create(run_id)?)))
        }
    }

    #[test]
    fn test_exited_worker_fails_run_as_infrastructure() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(ExitedProvider(ThreadSandboxProvider::new(
            dir.path().join("sandboxes"),
            1,
            StepRegistry::with_builtins(),
        )));
        let mut backend = RemoteBackend::new(provider, &config());
        let run = package(dir.path().join("run"));

        backend.prepare(&run).unwrap();
        let report = backend.execute(&run, &RunLog::in_memory(), None);
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.scope, FailureScope::Infrastructure);
        assert_eq!(failure.category, ErrorCategory::Network);
        assert!(failure.message.contains("closed the channel"));
        backend.teardown();
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.5KB");
        assert_eq!(format_bytes(1024 * 1024), "1.0MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 + 512 * 1024), "5.5MB");
    }
}
