//! Built-in step implementations.
//!
//! - `builtin.generate`: paginated synthetic source
//! - `builtin.filter`: push-down comparison filter
//! - `builtin.sql`: read-only query materialized as a table
//! - `builtin.export`: streams a table to a JSON Lines file

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path};

use serde::Deserialize;

use super::context::ExecutionContext;
use super::{
    output_table_name, parse_config, ConfigField, Step, StepDescriptor, StepInputs, StepOutputs,
    PRIMARY_OUTPUT,
};
use crate::error::StepError;
use crate::manifest::StepConfig;
use crate::monitoring::RowMetric;
use crate::store::{quote_ident, Batch, BatchSource, ColumnType, Schema, Value};

pub const GENERATE: &str = "builtin.generate";
pub const FILTER: &str = "builtin.filter";
pub const SQL: &str = "builtin.sql";
pub const EXPORT: &str = "builtin.export";

fn io_error(context: &str, err: std::io::Error) -> StepError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => StepError::permission(format!("{}: {}", context, err)),
        std::io::ErrorKind::TimedOut => StepError::timeout(format!("{}: {}", context, err)),
        _ => StepError::unknown(format!("{}: {}", context, err)),
    }
}

// ---------------------------------------------------------------------------
// builtin.generate
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GenerateConfig {
    rows: u64,
    #[serde(default = "default_start")]
    start: i64,
}

fn default_start() -> i64 {
    1
}

/// Emits `id = 1..=rows` and `value = start + index`, one page at a time.
pub struct GenerateSource {
    total: u64,
    emitted: u64,
    start: i64,
}

impl GenerateSource {
    pub fn new(total: u64, start: i64) -> Self {
        Self {
            total,
            emitted: 0,
            start,
        }
    }

    fn output_schema() -> Schema {
        Schema::default()
            .with_column("id", ColumnType::Integer)
            .with_column("value", ColumnType::Integer)
    }
}

impl BatchSource for GenerateSource {
    fn schema(&self) -> Schema {
        Self::output_schema()
    }

    fn next_batch(&mut self, max_rows: usize) -> Result<Option<Batch>, StepError> {
        let remaining = self.total - self.emitted;
        if remaining == 0 {
            return Ok(None);
        }
        let take = remaining.min(max_rows as u64);
        let mut batch = Batch::with_capacity(vec!["id".into(), "value".into()], take as usize);
        for offset in 0..take {
            let index = (self.emitted + offset) as i64;
            batch.push_row(vec![
                Value::Integer(index + 1),
                Value::Integer(self.start.saturating_add(index)),
            ]);
        }
        self.emitted += take;
        Ok(Some(batch))
    }
}

pub struct GenerateStep;

impl Step for GenerateStep {
    fn describe(&self) -> StepDescriptor {
        StepDescriptor::new(GENERATE, "Synthetic source producing columns id and value")
            .field(ConfigField::required("rows", "integer", "Number of rows to produce"))
            .field(ConfigField::optional(
                "start",
                "integer",
                "Value of the first row (default 1)",
            ))
    }

    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        parse_config::<GenerateConfig>(GENERATE, config).map(|_| ())
    }

    fn execute(
        &self,
        step_id: &str,
        config: &StepConfig,
        _inputs: &StepInputs,
        ctx: &ExecutionContext<'_>,
    ) -> Result<StepOutputs, StepError> {
        let cfg: GenerateConfig = parse_config(GENERATE, config)?;
        let mut source = GenerateSource::new(cfg.rows, cfg.start);

        let name = output_table_name(step_id, PRIMARY_OUTPUT);
        let table = ctx.store().create_table(step_id, &name, &source.schema())?;
        let written = ctx.store().append_stream(
            step_id,
            &name,
            &mut source,
            ctx.batch_size(),
            &mut || ctx.checkpoint(),
        )?;

        ctx.record_rows(step_id, RowMetric::RowsWritten, written);
        Ok(StepOutputs::primary(table))
    }
}

// ---------------------------------------------------------------------------
// builtin.filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    fn sql(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "=",
            Self::Ne => "<>",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterConfig {
    column: String,
    op: CompareOp,
    value: serde_json::Value,
    #[serde(default)]
    input: Option<String>,
}

impl FilterConfig {
    fn operand(&self) -> Result<Value, StepError> {
        match Value::from_json(&self.value) {
            Some(Value::Null) | None => Err(StepError::validation(format!(
                "filter value must be a number or string, got {}",
                self.value
            ))),
            Some(v) => Ok(v),
        }
    }
}

pub struct FilterStep;

impl Step for FilterStep {
    fn describe(&self) -> StepDescriptor {
        StepDescriptor::new(FILTER, "Keeps the rows of its input matching one comparison")
            .field(ConfigField::required("column", "string", "Column to compare"))
            .field(ConfigField::required("op", "gt|ge|lt|le|eq|ne", "Comparison operator"))
            .field(ConfigField::required("value", "number|string", "Right-hand operand"))
            .field(ConfigField::optional(
                "input",
                "string",
                "Upstream step to read when there are several",
            ))
    }

    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        let cfg: FilterConfig = parse_config(FILTER, config)?;
        cfg.operand().map(|_| ())
    }

    fn execute(
        &self,
        step_id: &str,
        config: &StepConfig,
        inputs: &StepInputs,
        ctx: &ExecutionContext<'_>,
    ) -> Result<StepOutputs, StepError> {
        let cfg: FilterConfig = parse_config(FILTER, config)?;
        let operand = cfg.operand()?;
        let input = inputs.named_or_single(step_id, cfg.input.as_deref())?;

        let store = ctx.store();
        let schema = store.schema(input.name())?;
        if !schema.contains(&cfg.column) {
            return Err(StepError::validation(format!(
                "column '{}' not found in table '{}' (columns: {})",
                cfg.column,
                input.name(),
                schema.column_names().join(", ")
            )));
        }
        let rows_read = store.row_count(input.name())?;
        ctx.checkpoint()?;

        // Same columns and declared types as the input, no rows
        let name = output_table_name(step_id, PRIMARY_OUTPUT);
        let table = store.create_table_as(
            step_id,
            &name,
            &format!("SELECT * FROM {} WHERE 0", quote_ident(input.name())),
        )?;
        let query = format!(
            "SELECT * FROM {} WHERE {} {} ?1",
            quote_ident(input.name()),
            quote_ident(&cfg.column),
            cfg.op.sql()
        );
        let written = store.insert_select(step_id, &name, &query, &[operand])?;

        ctx.record_rows(step_id, RowMetric::RowsRead, rows_read);
        ctx.record_rows(step_id, RowMetric::RowsProcessed, rows_read);
        ctx.record_rows(step_id, RowMetric::RowsWritten, written);
        Ok(StepOutputs::primary(table))
    }
}

// ---------------------------------------------------------------------------
// builtin.sql
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SqlConfig {
    query: String,
}

impl SqlConfig {
    fn check(&self) -> Result<(), StepError> {
        let head = self.query.trim_start().to_ascii_uppercase();
        if head.starts_with("SELECT") || head.starts_with("WITH") {
            Ok(())
        } else {
            Err(StepError::validation("query must start with SELECT or WITH"))
        }
    }
}

pub struct SqlStep;

impl Step for SqlStep {
    fn describe(&self) -> StepDescriptor {
        StepDescriptor::new(SQL, "Materializes a read-only query over upstream tables")
            .field(ConfigField::required(
                "query",
                "string",
                "SELECT statement; upstream tables are named by step id",
            ))
    }

    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        parse_config::<SqlConfig>(SQL, config)?.check()
    }

    fn execute(
        &self,
        step_id: &str,
        config: &StepConfig,
        inputs: &StepInputs,
        ctx: &ExecutionContext<'_>,
    ) -> Result<StepOutputs, StepError> {
        let cfg: SqlConfig = parse_config(SQL, config)?;
        cfg.check()?;

        let store = ctx.store();
        let mut rows_read = 0;
        for (_, table) in inputs.iter() {
            rows_read += store.row_count(table.name())?;
        }
        ctx.checkpoint()?;

        let name = output_table_name(step_id, PRIMARY_OUTPUT);
        let table = store.create_table_as(step_id, &name, &cfg.query)?;
        let written = store.row_count(&name)?;

        ctx.record_rows(step_id, RowMetric::RowsRead, rows_read);
        ctx.record_rows(step_id, RowMetric::RowsProcessed, rows_read);
        ctx.record_rows(step_id, RowMetric::RowsWritten, written);
        Ok(StepOutputs::primary(table))
    }
}

// ---------------------------------------------------------------------------
// builtin.export
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExportConfig {
    path: String,
    #[serde(default)]
    input: Option<String>,
}

impl ExportConfig {
    /// The export path must stay inside the outputs directory.
    fn relative_path(&self) -> Result<&Path, StepError> {
        let path = Path::new(&self.path);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if self.path.trim().is_empty() || escapes {
            return Err(StepError::validation(format!(
                "export path '{}' must be a relative path without '..'",
                self.path
            )));
        }
        Ok(path)
    }
}

pub struct ExportStep;

impl Step for ExportStep {
    fn describe(&self) -> StepDescriptor {
        StepDescriptor::new(EXPORT, "Writes its input to a JSON Lines file under outputs/")
            .field(ConfigField::required(
                "path",
                "string",
                "File path relative to the run's outputs directory",
            ))
            .field(ConfigField::optional(
                "input",
                "string",
                "Upstream step to read when there are several",
            ))
            .sink()
    }

    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        parse_config::<ExportConfig>(EXPORT, config)?
            .relative_path()
            .map(|_| ())
    }

    fn execute(
        &self,
        step_id: &str,
        config: &StepConfig,
        inputs: &StepInputs,
        ctx: &ExecutionContext<'_>,
    ) -> Result<StepOutputs, StepError> {
        let cfg: ExportConfig = parse_config(EXPORT, config)?;
        let destination = ctx.output_dir().join(cfg.relative_path()?);
        let input = inputs.named_or_single(step_id, cfg.input.as_deref())?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error("create output directory", e))?;
        }
        let file = File::create(&destination).map_err(|e| io_error("create export file", e))?;
        let mut out = BufWriter::new(file);

        let mut rows = 0u64;
        for batch in ctx.store().scan(input.name(), ctx.batch_size())? {
            ctx.checkpoint()?;
            let batch = batch?;
            batch
                .write_jsonl(&mut out)
                .map_err(|e| io_error("write export file", e))?;
            rows += batch.len() as u64;
        }
        out.flush().map_err(|e| io_error("flush export file", e))?;

        ctx.record_rows(step_id, RowMetric::RowsRead, rows);
        ctx.record_rows(step_id, RowMetric::RowsWritten, rows);
        Ok(StepOutputs::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::monitoring::RunLog;
    use crate::step::StepRegistry;
    use crate::store::{TableRef, TableStore};
    use serde_json::json;
    use tempfile::tempdir;

    fn config(value: serde_json::Value) -> StepConfig {
        serde_json::from_value(value).unwrap()
    }

    fn inputs(names: &[&str]) -> StepInputs {
        let mut inputs = StepInputs::new();
        for name in names {
            inputs.insert(*name, TableRef::new(*name));
        }
        inputs
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: TableStore,
        log: RunLog,
        registry: StepRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempdir().unwrap(),
                store: TableStore::open_in_memory().unwrap(),
                log: RunLog::in_memory(),
                registry: StepRegistry::with_builtins(),
            }
        }

        fn ctx(&self) -> ExecutionContext<'_> {
            ExecutionContext::new("run", &self.store, &self.log, &self.registry, self.dir.path())
                .with_batch_size(64)
        }
    }

    #[test]
    fn test_generate_source_pages() {
        let mut source = GenerateSource::new(5, 10);
        let first = source.next_batch(3).unwrap().unwrap();
        assert_eq!(first.rows[0], vec![Value::Integer(1), Value::Integer(10)]);
        let second = source.next_batch(3).unwrap().unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second.rows[1], vec![Value::Integer(5), Value::Integer(14)]);
        assert!(source.next_batch(3).unwrap().is_none());
    }

    #[test]
    fn test_generate_then_filter() {
        let fx = Fixture::new();
        let ctx = fx.ctx();

        let out = GenerateStep
            .execute("extract", &config(json!({"rows": 1000})), &StepInputs::new(), &ctx)
            .unwrap();
        assert_eq!(out.primary_table().unwrap().name(), "extract");
        assert_eq!(fx.store.row_count("extract").unwrap(), 1000);

        let filter = config(json!({"column": "value", "op": "gt", "value": 500}));
        FilterStep
            .execute("transform", &filter, &inputs(&["extract"]), &ctx)
            .unwrap();
        assert_eq!(fx.store.row_count("transform").unwrap(), 500);
        assert_eq!(ctx.rows_reported("transform", RowMetric::RowsRead), 1000);
        assert_eq!(ctx.rows_reported("transform", RowMetric::RowsWritten), 500);
    }

    #[test]
    fn test_generate_config_errors() {
        let step = GenerateStep;
        for bad in [json!({}), json!({"rows": -3}), json!({"rows": "many"}), json!({"rows": 1, "x": 1})] {
            let err = step.validate_config(&config(bad)).unwrap_err();
            assert_eq!(err.category, ErrorCategory::Validation);
        }
        assert!(step.validate_config(&config(json!({"rows": 0}))).is_ok());
    }

    #[test]
    fn test_filter_unknown_column() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        GenerateStep
            .execute("a", &config(json!({"rows": 3})), &StepInputs::new(), &ctx)
            .unwrap();
        let err = FilterStep
            .execute(
                "b",
                &config(json!({"column": "amount", "op": "eq", "value": 1})),
                &inputs(&["a"]),
                &ctx,
            )
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(err.message.contains("amount"));
        assert!(!fx.store.exists("b").unwrap());
    }

    #[test]
    fn test_filter_rejects_bad_operator() {
        let err = FilterStep
            .validate_config(&config(json!({"column": "v", "op": "like", "value": 1})))
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
    }

    #[test]
    fn test_sql_aggregate() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        GenerateStep
            .execute("a", &config(json!({"rows": 10})), &StepInputs::new(), &ctx)
            .unwrap();
        SqlStep
            .execute(
                "totals",
                &config(json!({"query": "SELECT COUNT(*) AS n, SUM(value) AS total FROM a"})),
                &inputs(&["a"]),
                &ctx,
            )
            .unwrap();
        let batch = fx.store.scan("totals", 10).unwrap().next().unwrap().unwrap();
        assert_eq!(batch.rows[0], vec![Value::Integer(10), Value::Integer(55)]);
    }

    #[test]
    fn test_sql_rejects_writes() {
        let err = SqlStep
            .validate_config(&config(json!({"query": "DROP TABLE a"})))
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
    }

    #[test]
    fn test_export_writes_jsonl() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        GenerateStep
            .execute("a", &config(json!({"rows": 150})), &StepInputs::new(), &ctx)
            .unwrap();
        let out = ExportStep
            .execute("write", &config(json!({"path": "nested/a.jsonl"})), &inputs(&["a"]), &ctx)
            .unwrap();
        assert!(out.is_empty());

        let content = fs::read_to_string(fx.dir.path().join("outputs/nested/a.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 150);
        assert_eq!(ctx.rows_reported("write", RowMetric::RowsWritten), 150);
    }

    #[test]
    fn test_export_path_must_stay_inside() {
        for bad in ["../escape.jsonl", "/etc/passwd", "", "a/../../b"] {
            let err = ExportStep
                .validate_config(&config(json!({ "path": bad })))
                .unwrap_err();
            assert_eq!(err.category, ErrorCategory::Validation, "path {:?}", bad);
        }
    }

    #[test]
    fn test_generate_stops_at_deadline() {
        let fx = Fixture::new();
        let ctx = fx.ctx().with_deadline(Some(std::time::Instant::now()));
        let err = GenerateStep
            .execute("a", &config(json!({"rows": 10})), &StepInputs::new(), &ctx)
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Timeout);
    }
}
