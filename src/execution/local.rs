//! Local Backend
//!
//! Runs every step in-process, one after another, against a table store
//! owned by this backend.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use log::{info, warn};

use super::artifacts::{collect_local, STORE_FILE};
use super::backend::{Backend, BackendKind, PreparedRun};
use super::record::{FailureDetail, RecordBook, RunReport};
use super::runner::StepRunner;
use crate::config::StoreMode;
use crate::error::{EngineError, ErrorCategory};
use crate::monitoring::EventSink;
use crate::step::{ExecutionContext, StepRegistry};
use crate::store::TableStore;

pub struct LocalBackend {
    registry: StepRegistry,
    store_mode: StoreMode,
    keep_store: bool,
    store: Option<TableStore>,
}

impl LocalBackend {
    pub fn new(registry: StepRegistry) -> Self {
        Self {
            registry,
            store_mode: StoreMode::File,
            keep_store: false,
            store: None,
        }
    }

    pub fn with_store_mode(mut self, mode: StoreMode) -> Self {
        self.store_mode = mode;
        self
    }

    /// Keep `store.db` in the run directory after teardown.
    pub fn with_keep_store(mut self, keep: bool) -> Self {
        self.keep_store = keep;
        self
    }

    pub fn store(&self) -> Option<&TableStore> {
        self.store.as_ref()
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn prepare(&mut self, run: &PreparedRun) -> Result<(), EngineError> {
        fs::create_dir_all(run.run_dir())?;
        let store = match self.store_mode {
            StoreMode::File => TableStore::open(&run.run_dir().join(STORE_FILE))?,
            StoreMode::Memory => TableStore::open_in_memory()?,
        };
        if let Some(threads) = run.settings.cpu_limit {
            store.set_threads(threads)?;
        }
        info!("Local backend prepared for run {}", run.run_id);
        self.store = Some(store);
        Ok(())
    }

    fn execute(
        &mut self,
        run: &PreparedRun,
        sink: &dyn EventSink,
        deadline: Option<Instant>,
    ) -> RunReport {
        let Some(store) = self.store.as_ref() else {
            let book = RecordBook::new(run.plan.iter().map(String::as_str));
            return book.into_report(Some(FailureDetail::infrastructure(
                ErrorCategory::Unknown,
                EngineError::NotPrepared.to_string(),
            )));
        };

        let ctx = ExecutionContext::new(&run.run_id, store, sink, &self.registry, run.run_dir())
            .with_batch_size(run.settings.batch_size)
            .with_deadline(deadline);
        let redactor = run.redactor();
        StepRunner::new(&ctx, &run.settings.retry, &redactor).run(run)
    }

    fn collect(&mut self, run: &PreparedRun) -> Result<Vec<PathBuf>, EngineError> {
        let store = self.store.as_ref().ok_or(EngineError::NotPrepared)?;
        let files = collect_local(store, run.run_dir())?;
        info!("Collected {} artifact(s)", files.len());
        Ok(files)
    }

    fn teardown(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(e) = store.close(self.keep_store) {
                warn!("Failed to close table store: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{RetryPolicy, RunOutcome, RunSettings};
    use crate::manifest::StepSpec;
    use crate::monitoring::RunLog;
    use tempfile::tempdir;

    fn package(run_dir: PathBuf) -> PreparedRun {
        let steps = vec![
            StepSpec::new("extract", "builtin.generate").with_config("rows", 20),
            StepSpec::new("write", "builtin.export")
                .with_config("path", "rows.jsonl")
                .depends_on("extract"),
        ];
        PreparedRun {
            run_id: "local-test".into(),
            plan: steps.iter().map(|s| s.id.clone()).collect(),
            steps,
            settings: RunSettings {
                batch_size: 8,
                retry: RetryPolicy::none(),
                timeout_ms: None,
                cpu_limit: None,
            },
            run_dir,
        }
    }

    #[test]
    fn test_lifecycle_with_file_store() {
        let dir = tempdir().unwrap();
        let run = package(dir.path().join("run"));
        let mut backend = LocalBackend::new(StepRegistry::with_builtins());

        backend.prepare(&run).unwrap();
        assert!(run.run_dir().join(STORE_FILE).exists());

        let log = RunLog::in_memory();
        let report = backend.execute(&run, &log, None);
        assert_eq!(report.outcome(), RunOutcome::Success);
        assert_eq!(report.record("write").unwrap().row_count, Some(20));

        let files = backend.collect(&run).unwrap();
        assert!(files.contains(&PathBuf::from("tables/extract.jsonl")));
        assert!(files.contains(&PathBuf::from("outputs/rows.jsonl")));

        backend.teardown();
        backend.teardown();
        assert!(!run.run_dir().join(STORE_FILE).exists());
    }

    #[test]
    fn test_execute_without_prepare() {
        let dir = tempdir().unwrap();
        let run = package(dir.path().to_path_buf());
        let mut backend = LocalBackend::new(StepRegistry::with_builtins())
            .with_store_mode(StoreMode::Memory);
        let report = backend.execute(&run, &RunLog::in_memory(), None);
        assert_eq!(report.outcome(), RunOutcome::Failed);
        assert!(matches!(backend.collect(&run), Err(EngineError::NotPrepared)));
    }
}
