//! Run Coordinator
//!
//! Turns a manifest into a run:
//! 1. Validate the manifest and check every implementation is registered
//! 2. Resolve each step's configuration and build the [`PreparedRun`]
//! 3. Create the run directory and its event and metric logs
//! 4. Drive the configured backend through prepare, execute and collect
//! 5. Write `status.json`
//!
//! Teardown of the backend is guaranteed by a drop guard, so the store and
//! the sandbox are released on every path out of [`RunCoordinator::run`].
//!
//! # Example
//!
//! ```rust,no_run
//! use piperunner::{load_manifest, EngineConfig, RunCoordinator, StepRegistry};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manifest = load_manifest("pipeline.yaml")?;
//!     let coordinator = RunCoordinator::new(EngineConfig::default(), StepRegistry::with_builtins());
//!     let status = coordinator.run(&manifest)?;
//!     println!("{}", status.summary());
//!     Ok(())
//! }
//! ```

pub mod status;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::config::{EngineConfig, SandboxKind};
use crate::error::EngineError;
use crate::execution::artifacts::{EVENTS_FILE, METRICS_FILE, STATUS_FILE};
use crate::execution::{
    Backend, BackendKind, FailureDetail, LocalBackend, PreparedRun, RecordBook, RunReport,
    RunSettings,
};
use crate::manifest::{validate_manifest, Manifest, StepConfig, StepSpec};
use crate::monitoring::{EventKind, EventSink, RunEvent, RunLog};
use crate::remote::{ProcessSandboxProvider, RemoteBackend, SandboxProvider, ThreadSandboxProvider};
use crate::step::{HealthReport, StepRegistry};

pub use status::RunStatus;

/// Produces the final configuration of a step (secret lookup, templating).
pub trait ConfigResolver: Send + Sync {
    fn resolve(&self, step: &StepSpec) -> Result<StepConfig, String>;
}

/// Uses each step's configuration as written.
pub struct PassthroughResolver;

impl ConfigResolver for PassthroughResolver {
    fn resolve(&self, step: &StepSpec) -> Result<StepConfig, String> {
        Ok(step.config.clone())
    }
}

/// Calls `teardown` when dropped.
struct BackendGuard {
    backend: Option<Box<dyn Backend>>,
}

impl Drop for BackendGuard {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.teardown();
        }
    }
}

pub struct RunCoordinator {
    config: EngineConfig,
    registry: StepRegistry,
    resolver: Box<dyn ConfigResolver>,
    provider: OnceCell<Arc<dyn SandboxProvider>>,
}

impl RunCoordinator {
    pub fn new(config: EngineConfig, registry: StepRegistry) -> Self {
        Self {
            config,
            registry,
            resolver: Box::new(PassthroughResolver),
            provider: OnceCell::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: impl ConfigResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Uses `provider` for remote runs instead of the configured one.
    pub fn with_sandbox_provider(self, provider: Arc<dyn SandboxProvider>) -> Self {
        let _ = self.provider.set(provider);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Shared by every remote run of this coordinator, so its quota spans runs.
    fn sandbox_provider(&self) -> Result<Arc<dyn SandboxProvider>, EngineError> {
        self.provider
            .get_or_try_init(|| {
                let sandbox = &self.config.sandbox;
                let provider: Arc<dyn SandboxProvider> = match sandbox.provider {
                    SandboxKind::Process => Arc::new(ProcessSandboxProvider::new(
                        sandbox.root_dir(),
                        sandbox.max_sandboxes,
                        sandbox.worker_program.clone(),
                    )?),
                    SandboxKind::Thread => Arc::new(ThreadSandboxProvider::new(
                        sandbox.root_dir(),
                        sandbox.max_sandboxes,
                        self.registry.clone(),
                    )),
                };
                Ok::<_, EngineError>(provider)
            })
            .cloned()
    }

    fn create_backend(&self) -> Result<Box<dyn Backend>, EngineError> {
        Ok(match self.config.backend {
            BackendKind::Local => Box::new(
                LocalBackend::new(self.registry.clone())
                    .with_store_mode(self.config.store)
                    .with_keep_store(self.config.keep_store),
            ),
            BackendKind::Remote => Box::new(RemoteBackend::new(
                self.sandbox_provider()?,
                &self.config.sandbox,
            )),
        })
    }

    fn check_implementations(&self, manifest: &Manifest) -> Result<(), EngineError> {
        for step in &manifest.steps {
            if !self.registry.contains(&step.implementation) {
                return Err(EngineError::UnknownImplementation {
                    step_id: step.id.clone(),
                    implementation: step.implementation.clone(),
                });
            }
        }
        Ok(())
    }

    /// Static checks plus each step's own health check, without running
    /// anything.
    pub fn validate(&self, manifest: &Manifest) -> Result<Vec<(String, HealthReport)>, EngineError> {
        validate_manifest(manifest)?;
        self.check_implementations(manifest)?;

        let mut reports = Vec::new();
        for step in &manifest.steps {
            let config = self.resolve_config(step)?;
            if let Some(handler) = self.registry.resolve(&step.implementation) {
                reports.push((step.id.clone(), handler.check(&config)));
            }
        }
        Ok(reports)
    }

    fn resolve_config(&self, step: &StepSpec) -> Result<StepConfig, EngineError> {
        self.resolver
            .resolve(step)
            .map_err(|message| EngineError::Resolve {
                step_id: step.id.clone(),
                message,
            })
    }

    /// Builds the immutable package for one run.
    pub fn prepare_run(&self, manifest: &Manifest) -> Result<PreparedRun, EngineError> {
        let plan = validate_manifest(manifest)?;
        self.check_implementations(manifest)?;

        let steps = manifest
            .steps
            .iter()
            .map(|step| {
                Ok(StepSpec {
                    config: self.resolve_config(step)?,
                    ..step.clone()
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let run_id = Uuid::new_v4().to_string();
        let run_dir = self.config.runs_dir().join(&run_id);
        let cpu_limit = (self.config.backend == BackendKind::Remote)
            .then_some(self.config.sandbox.cpu_limit);

        Ok(PreparedRun {
            run_id,
            steps,
            plan: plan.into_order(),
            settings: RunSettings {
                batch_size: self.config.batch_size,
                retry: self.config.retry.clone(),
                timeout_ms: self.config.run_timeout().map(|t| t.as_millis() as u64),
                cpu_limit,
            },
            run_dir,
        })
    }

    /// Runs a manifest end to end. Step and infrastructure failures are
    /// reported in the returned status; `Err` means the run never started.
    pub fn run(&self, manifest: &Manifest) -> Result<RunStatus, EngineError> {
        let run = self.prepare_run(manifest)?;
        self.run_prepared(&run)
    }

    pub fn run_prepared(&self, run: &PreparedRun) -> Result<RunStatus, EngineError> {
        let run_dir = run.run_dir();
        fs::create_dir_all(run_dir)?;
        let log = RunLog::with_files(&run_dir.join(EVENTS_FILE), &run_dir.join(METRICS_FILE))?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = self.config.run_timeout().map(|t| clock + t);
        info!(
            "Starting run {} ({} steps, {} backend) in {}",
            run.run_id,
            run.plan.len(),
            self.config.backend,
            run_dir.display()
        );

        log.event(RunEvent::run(
            &run.run_id,
            EventKind::RunStarted {
                step_count: run.plan.len(),
            },
        ));

        let mut guard = BackendGuard { backend: None };
        let mut artifacts = Vec::new();
        let report = match self.create_backend() {
            Ok(backend) => {
                let backend = guard.backend.insert(backend);
                match backend.prepare(run) {
                    Ok(()) => {
                        let report = backend.execute(run, &log, deadline);
                        match backend.collect(run) {
                            Ok(files) => artifacts = files,
                            Err(e) => warn!("Artifact collection failed: {}", e),
                        }
                        report
                    }
                    Err(e) => prepare_failure(run, &e),
                }
            }
            Err(e) => prepare_failure(run, &e),
        };

        if let Some(mut backend) = guard.backend.take() {
            backend.teardown();
        }

        let outcome = report.outcome();
        log.event(RunEvent::run(&run.run_id, EventKind::RunFinished { status: outcome }));
        if let Err(e) = log.flush() {
            warn!("Failed to flush run log: {}", e);
        }

        let mut files: Vec<PathBuf> = vec![
            EVENTS_FILE.into(),
            METRICS_FILE.into(),
            STATUS_FILE.into(),
        ];
        files.extend(artifacts);

        let status = RunStatus {
            run_id: run.run_id.clone(),
            backend: self.config.backend,
            status: outcome,
            failure: report.failure,
            steps: report.records,
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            artifacts: files,
        };
        status.save(&run_dir.join(STATUS_FILE))?;
        info!("{}", status.summary());
        Ok(status)
    }
}

/// Report for a run whose backend never reached execution: every step stays
/// pending and the failure is attributed to the infrastructure.
fn prepare_failure(run: &PreparedRun, err: &EngineError) -> RunReport {
    error!("Backend could not be prepared: {}", err);
    let detail = FailureDetail::infrastructure(
        err.category(),
        run.redactor().redact(&format!("backend prepare failed: {}", err)),
    );
    RecordBook::new(run.plan.iter().map(String::as_str)).into_report(Some(detail))
}
