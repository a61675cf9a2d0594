//! Sandbox Worker
//!
//! Serves the protocol inside a sandbox. It answers requests in order,
//! runs the package with the same [`StepRunner`] the local backend uses,
//! and streams every event, metric and log line back as it happens. A
//! separate thread sends heartbeats for as long as the worker is serving.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn, Level};

use crate::error::{EngineError, ErrorCategory};
use crate::execution::artifacts::{collect_local, STORE_FILE};
use crate::execution::{PreparedRun, RunReport, StepRunner};
use crate::monitoring::{EventSink, Metric, RunEvent};
use crate::rpc::{Call, FrameReader, FrameWriter, Message, Reply, RpcError, WorkerEvent, PROTOCOL_VERSION};
use crate::step::{ExecutionContext, StepRegistry};
use crate::store::TableStore;

const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(1000);

/// Granularity of the heartbeat thread's sleep.
const HEARTBEAT_POLL: Duration = Duration::from_millis(20);

type SharedWriter<W> = Arc<Mutex<FrameWriter<W>>>;

/// Writes frames unless the worker has been told to stop.
struct Outbox<W: Write> {
    writer: SharedWriter<W>,
    stop: Arc<AtomicBool>,
}

impl<W: Write> Clone for Outbox<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            stop: Arc::clone(&self.stop),
        }
    }
}

impl<W: Write> Outbox<W> {
    fn lock(&self) -> MutexGuard<'_, FrameWriter<W>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, message: &Message) -> Result<(), RpcError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(RpcError::Aborted("worker stopped".into()));
        }
        self.lock().send(message)
    }
}

/// Forwards the run's events to the initiator.
struct RpcSink<W: Write> {
    outbox: Outbox<W>,
}

impl<W: Write> RpcSink<W> {
    fn forward(&self, payload: WorkerEvent) {
        if let Err(e) = self.outbox.send(&Message::event(payload)) {
            debug!("Dropped event: {}", e);
        }
    }
}

impl<W: Write + Send> EventSink for RpcSink<W> {
    fn event(&self, event: RunEvent) {
        self.forward(WorkerEvent::Progress { event });
    }

    fn metric(&self, metric: Metric) {
        self.forward(WorkerEvent::Metric { metric });
    }

    fn log(&self, level: Level, message: &str) {
        log::log!(level, "{}", message);
        self.forward(WorkerEvent::Log {
            level: level.as_str().to_ascii_lowercase(),
            message: message.to_string(),
        });
    }
}

pub struct SandboxWorker {
    root: PathBuf,
    registry: StepRegistry,
    heartbeat: Duration,
    stop: Arc<AtomicBool>,
}

/// State of one served run.
struct Session {
    store: Option<TableStore>,
    started: bool,
}

impl SandboxWorker {
    pub fn new(root: &Path, registry: StepRegistry) -> Self {
        Self {
            root: root.to_path_buf(),
            registry,
            heartbeat: DEFAULT_HEARTBEAT,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Interval until the handshake sets one.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    /// Flag that silences the worker, stops dispatching steps of a running
    /// package and ends `serve` at the next request.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Serves requests until `shutdown`, end of input, or stop.
    pub fn serve<R, W>(self, reader: R, writer: W) -> Result<(), RpcError>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        let outbox = Outbox {
            writer: Arc::new(Mutex::new(FrameWriter::new(writer))),
            stop: Arc::clone(&self.stop),
        };
        let interval_ms = Arc::new(AtomicU64::new(self.heartbeat.as_millis().max(1) as u64));
        let serving = Arc::new(AtomicBool::new(true));
        let heartbeat = spawn_heartbeat(outbox.clone(), Arc::clone(&interval_ms), Arc::clone(&serving))?;

        info!("Worker {} serving sandbox {}", process::id(), self.root.display());
        let mut session = Session {
            store: None,
            started: false,
        };
        let mut frames = FrameReader::new(reader);
        let result = loop {
            if self.stop.load(Ordering::SeqCst) {
                break Ok(());
            }
            let (id, call) = match frames.next_frame() {
                Ok(Some(Message::Request { id, call })) => (id, call),
                Ok(Some(other)) => {
                    warn!("Ignoring unexpected frame: {:?}", other);
                    continue;
                }
                Ok(None) => {
                    debug!("Initiator closed the channel");
                    break Ok(());
                }
                Err(e) => break Err(e),
            };

            let shutdown = matches!(call, Call::Shutdown);
            let response = self.handle(id, call, &mut session, &outbox, &interval_ms);
            if let Err(e) = outbox.send(&response) {
                break Err(e);
            }
            if shutdown {
                break Ok(());
            }
        };

        serving.store(false, Ordering::SeqCst);
        if heartbeat.join().is_err() {
            warn!("Heartbeat thread panicked");
        }
        if let Some(store) = session.store.take() {
            if let Err(e) = store.close(false) {
                warn!("Failed to close sandbox store: {}", e);
            }
        }
        info!("Worker {} stopped", process::id());
        match result {
            Err(RpcError::Aborted(_)) => Ok(()),
            other => other,
        }
    }

    fn handle<W: Write + Send + 'static>(
        &self,
        id: u64,
        call: Call,
        session: &mut Session,
        outbox: &Outbox<W>,
        interval_ms: &AtomicU64,
    ) -> Message {
        match call {
            Call::Handshake {
                protocol_version,
                heartbeat_interval_ms,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Message::error(
                        id,
                        ErrorCategory::Validation,
                        format!(
                            "protocol version mismatch: initiator {}, worker {}",
                            protocol_version, PROTOCOL_VERSION
                        ),
                    );
                }
                interval_ms.store(heartbeat_interval_ms.max(1), Ordering::SeqCst);
                Message::ok(
                    id,
                    Reply::Handshake {
                        protocol_version: PROTOCOL_VERSION,
                        worker_pid: process::id(),
                    },
                )
            }
            Call::Start { package } => {
                if session.started {
                    return Message::error(id, ErrorCategory::Validation, "run already started");
                }
                session.started = true;
                match self.run(*package, session, outbox) {
                    Ok(report) => Message::ok(id, Reply::Completed { report }),
                    Err(e) => Message::error(id, e.category(), e.to_string()),
                }
            }
            Call::Collect => match session.store.as_ref() {
                Some(store) => match collect_local(store, &self.root) {
                    Ok(files) => Message::ok(id, Reply::Collected { files }),
                    Err(e) => Message::error(id, e.category(), e.to_string()),
                },
                None => Message::error(id, ErrorCategory::Validation, "no run to collect"),
            },
            Call::Shutdown => Message::ok(id, Reply::Bye),
        }
    }

    fn run<W: Write + Send + 'static>(
        &self,
        package: PreparedRun,
        session: &mut Session,
        outbox: &Outbox<W>,
    ) -> Result<RunReport, EngineError> {
        let run = package.with_run_dir(&self.root);
        let deadline = run
            .settings
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        let store = TableStore::open(&self.root.join(STORE_FILE))?;
        if let Some(threads) = run.settings.cpu_limit {
            let applied = store.set_threads(threads)?;
            debug!("Store threads limited to {}", applied);
        }

        info!("Running {} step(s) for run {}", run.plan.len(), run.run_id);
        let sink = RpcSink {
            outbox: outbox.clone(),
        };
        let report = {
            let ctx = ExecutionContext::new(&run.run_id, &store, &sink, &self.registry, run.run_dir())
                .with_batch_size(run.settings.batch_size)
                .with_deadline(deadline)
                .with_cancel_flag(Arc::clone(&self.stop));
            let redactor = run.redactor();
            StepRunner::new(&ctx, &run.settings.retry, &redactor).run(&run)
        };
        session.store = Some(store);
        Ok(report)
    }
}

fn spawn_heartbeat<W: Write + Send + 'static>(
    outbox: Outbox<W>,
    interval_ms: Arc<AtomicU64>,
    serving: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, RpcError> {
    let handle = thread::Builder::new()
        .name("heartbeat".into())
        .spawn(move || {
            let mut seq = 0u64;
            let mut last = None::<Instant>;
            while serving.load(Ordering::SeqCst) {
                let interval = Duration::from_millis(interval_ms.load(Ordering::SeqCst));
                if last.map_or(true, |t| t.elapsed() >= interval) {
                    if outbox
                        .send(&Message::event(WorkerEvent::Heartbeat { seq }))
                        .is_err()
                    {
                        break;
                    }
                    seq += 1;
                    last = Some(Instant::now());
                }
                thread::sleep(HEARTBEAT_POLL.min(interval));
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{RetryPolicy, RunOutcome, RunSettings};
    use crate::manifest::StepSpec;
    use crate::rpc::pipe::pipe;
    use crate::rpc::{IgnoreEvents, RpcClient};
    use tempfile::tempdir;

    fn package() -> PreparedRun {
        let steps = vec![
            StepSpec::new("extract", "builtin.generate").with_config("rows", 50),
            StepSpec::new("big", "builtin.filter")
                .with_config("column", "value")
                .with_config("op", "ge")
                .with_config("value", 26)
                .depends_on("extract"),
        ];
        PreparedRun {
            run_id: "worker-test".into(),
            plan: steps.iter().map(|s| s.id.clone()).collect(),
            steps,
            settings: RunSettings {
                batch_size: 16,
                retry: RetryPolicy::none(),
                timeout_ms: Some(30_000),
                cpu_limit: Some(1),
            },
            run_dir: PathBuf::new(),
        }
    }

    fn start_worker(root: &Path) -> (RpcClient, thread::JoinHandle<Result<(), RpcError>>) {
        let (req_tx, req_rx) = pipe();
        let (rep_tx, rep_rx) = pipe();
        let worker = SandboxWorker::new(root, StepRegistry::with_builtins())
            .with_heartbeat_interval(Duration::from_millis(20));
        let handle = thread::spawn(move || worker.serve(req_rx, rep_tx));
        let client = RpcClient::connect(rep_rx, req_tx, Duration::from_secs(5)).unwrap();
        (client, handle)
    }

    #[test]
    fn test_full_session() {
        let dir = tempdir().unwrap();
        let (mut client, handle) = start_worker(dir.path());

        let reply = client
            .call(
                Call::Handshake {
                    protocol_version: PROTOCOL_VERSION,
                    heartbeat_interval_ms: 20,
                },
                None,
                &mut IgnoreEvents,
            )
            .unwrap();
        assert!(matches!(reply, Reply::Handshake { protocol_version: 1, .. }));

        let reply = client
            .call(
                Call::Start {
                    package: Box::new(package()),
                },
                None,
                &mut IgnoreEvents,
            )
            .unwrap();
        let Reply::Completed { report } = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        assert_eq!(report.outcome(), RunOutcome::Success);
        assert_eq!(report.record("big").unwrap().row_count, Some(25));

        let Reply::Collected { files } = client.call(Call::Collect, None, &mut IgnoreEvents).unwrap()
        else {
            panic!("expected collected");
        };
        assert!(files.contains(&PathBuf::from("tables/big.jsonl")));
        assert!(dir.path().join("tables/big.jsonl").exists());

        let reply = client.call(Call::Shutdown, None, &mut IgnoreEvents).unwrap();
        assert_eq!(reply, Reply::Bye);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let (mut client, handle) = start_worker(dir.path());
        let err = client
            .call(
                Call::Handshake {
                    protocol_version: PROTOCOL_VERSION + 1,
                    heartbeat_interval_ms: 20,
                },
                None,
                &mut IgnoreEvents,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Remote {
                category: ErrorCategory::Validation,
                ..
            }
        ));

        let err = client.call(Call::Collect, None, &mut IgnoreEvents).unwrap_err();
        assert!(matches!(err, RpcError::Remote { .. }));

        drop(client);
        handle.join().unwrap().unwrap();
    }
}
