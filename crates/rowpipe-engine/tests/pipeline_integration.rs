//! End-to-end pipeline runs with small in-test transforms.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rowpipe_engine::config::parser::parse_pipeline_str;
use rowpipe_engine::config::types::PipelineConfig;
use rowpipe_engine::instance::InstanceOutcome;
use rowpipe_engine::registry::parse_config;
use rowpipe_engine::resource::{FileNaming, MemoryTarget, OutputTarget, SplitWriter};
use rowpipe_engine::transform::{RowOutcome, Source, StepContext, Transform};
use rowpipe_engine::{check_pipeline, run_pipeline, ExecutionOptions, PipelineError, TransformRegistry};
use rowpipe_types::error::{TransformError, ValidationResult, ValidationStatus};
use rowpipe_types::schema::{FieldDescriptor, RowSchema, ValueType};
use rowpipe_types::state::RunStatus;
use rowpipe_types::value::{Row, Value};
use rowpipe_types::variables::Variables;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

#[derive(Deserialize)]
struct NumbersConfig {
    count: i64,
}

/// Emits `n = 0..count`.
struct Numbers {
    next: i64,
    count: i64,
}

impl Source for Numbers {
    fn derive_output_schema(&self, ctx: &StepContext) -> Result<RowSchema, TransformError> {
        RowSchema::from_fields(vec![FieldDescriptor::new("n", ValueType::Integer, ctx.step_name())])
    }

    fn next_row(
        &mut self,
        _output: &RowSchema,
        ctx: &StepContext,
    ) -> Result<Option<RowOutcome>, TransformError> {
        if self.next >= self.count {
            return Ok(None);
        }
        ctx.counters().increment_lines_input();
        let row = Row::new(vec![Value::Integer(self.next)]);
        self.next += 1;
        Ok(Some(RowOutcome::one(row)))
    }
}

#[derive(Deserialize)]
struct CheckConfig {
    #[serde(default)]
    reject: Option<i64>,
}

/// Appends `square`; rejects the configured value as a row error.
struct Square {
    reject: Option<i64>,
    derivations: Arc<AtomicUsize>,
}

impl Transform for Square {
    fn validate(&self, _variables: &dyn Variables) -> ValidationResult {
        match self.reject {
            Some(n) if n < 0 => ValidationResult::failed("reject must not be negative"),
            _ => ValidationResult::success("ok"),
        }
    }

    fn derive_output_schema(
        &self,
        input: &RowSchema,
        ctx: &StepContext,
    ) -> Result<RowSchema, TransformError> {
        self.derivations.fetch_add(1, Ordering::SeqCst);
        let mut out = input.clone();
        out.push(FieldDescriptor::new("square", ValueType::Integer, ctx.step_name()))?;
        Ok(out)
    }

    fn process_row(&mut self, mut row: Row, _ctx: &StepContext) -> RowOutcome {
        let Value::Integer(n) = row[0] else {
            return RowOutcome::failed(row, TransformError::data("NOT_A_NUMBER", "n is not a number"));
        };
        if Some(n) == self.reject {
            return RowOutcome::failed(
                row,
                TransformError::data("REJECTED", format!("value {n} is rejected")).with_field("n"),
            );
        }
        row.push(Value::Integer(n * n));
        RowOutcome::one(row)
    }
}

/// Terminal step recording what it receives.
struct Collect {
    rows: Arc<Mutex<Vec<(RowSchema, Row)>>>,
    schema: Option<RowSchema>,
}

impl Transform for Collect {
    fn derive_output_schema(
        &self,
        input: &RowSchema,
        _ctx: &StepContext,
    ) -> Result<RowSchema, TransformError> {
        Ok(input.clone())
    }

    fn on_first_row(
        &mut self,
        input: &RowSchema,
        _output: &RowSchema,
        _ctx: &StepContext,
    ) -> Result<(), TransformError> {
        self.schema = Some(input.clone());
        Ok(())
    }

    fn process_row(&mut self, row: Row, _ctx: &StepContext) -> RowOutcome {
        let schema = self.schema.clone().unwrap_or_default();
        self.rows.lock().unwrap().push((schema, row.clone()));
        RowOutcome::one(row)
    }
}

#[derive(Deserialize)]
struct LinesConfig {
    name: String,
    split_every: u64,
    #[serde(default)]
    lazy_open: bool,
}

/// Writes `n` per line through a split writer.
struct Lines {
    config: LinesConfig,
    writer: Option<SplitWriter>,
    /// Overrides the run's target so a test can inspect it.
    target: Option<Arc<dyn OutputTarget>>,
}

impl Transform for Lines {
    fn init(&mut self, ctx: &StepContext) -> Result<(), TransformError> {
        let naming = FileNaming {
            base: ctx.resolve(&self.config.name),
            extension: Some("txt".into()),
            include_copy_nr: false,
            split_every: self.config.split_every,
        };
        let target = self.target.clone().unwrap_or_else(|| ctx.target());
        let mut writer = SplitWriter::new(target, naming, ctx.copy());
        if !self.config.lazy_open {
            writer.open_next()?;
        }
        self.writer = Some(writer);
        Ok(())
    }

    fn derive_output_schema(
        &self,
        input: &RowSchema,
        _ctx: &StepContext,
    ) -> Result<RowSchema, TransformError> {
        Ok(input.clone())
    }

    fn process_row(&mut self, row: Row, ctx: &StepContext) -> RowOutcome {
        let Some(writer) = self.writer.as_mut() else {
            return RowOutcome::failed(row, TransformError::internal("NOT_OPEN", "writer missing"));
        };
        let written = writer
            .rotate_if_due(ctx.counters())
            .and_then(|_| writer.write_row(&format!("{}\n", row[0].as_text().unwrap_or_default())));
        match written {
            Ok(()) => {
                ctx.counters().increment_lines_output();
                RowOutcome::one(row)
            }
            Err(error) => RowOutcome::failed(row, error),
        }
    }

    fn dispose(&mut self, ctx: &StepContext) -> Result<(), TransformError> {
        if let Some(writer) = self.writer.as_mut() {
            for path in writer.opened_paths() {
                ctx.add_result_file(path.clone(), "lines");
            }
            writer.close(ctx.counters());
        }
        Ok(())
    }
}

struct Harness {
    registry: TransformRegistry,
    collected: Arc<Mutex<Vec<(RowSchema, Row)>>>,
    derivations: Arc<AtomicUsize>,
    memory: MemoryTarget,
}

fn harness() -> Harness {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let derivations = Arc::new(AtomicUsize::new(0));
    let mut registry = TransformRegistry::new();
    registry.register_source("numbers", "Count up", |config| {
        let config: NumbersConfig = parse_config(config)?;
        Ok(Numbers {
            next: 0,
            count: config.count,
        })
    });
    let counter = Arc::clone(&derivations);
    registry.register_transform("square", "Square n", move |config| {
        let config: CheckConfig = parse_config(config)?;
        Ok(Square {
            reject: config.reject,
            derivations: Arc::clone(&counter),
        })
    });
    let sink = Arc::clone(&collected);
    registry.register_transform("collect", "Record rows", move |_| {
        Ok(Collect {
            rows: Arc::clone(&sink),
            schema: None,
        })
    });
    registry.register_transform("lines", "Write n per line", |config| {
        Ok(Lines {
            config: parse_config(config)?,
            writer: None,
            target: None,
        })
    });
    let memory = MemoryTarget::new();
    let shared = memory.clone();
    registry.register_transform("memory-lines", "Write n per line to memory", move |config| {
        Ok(Lines {
            config: parse_config(config)?,
            writer: None,
            target: Some(Arc::new(shared.clone())),
        })
    });
    Harness {
        registry,
        collected,
        derivations,
        memory,
    }
}

fn pipeline(yaml: &str) -> PipelineConfig {
    parse_pipeline_str(yaml).unwrap()
}

fn collected_values(h: &Harness) -> Vec<i64> {
    let mut values: Vec<i64> = h
        .collected
        .lock()
        .unwrap()
        .iter()
        .filter_map(|(_, row)| match row[0] {
            Value::Integer(n) => Some(n),
            _ => None,
        })
        .collect();
    values.sort_unstable();
    values
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rows_flow_through_parallel_copies() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: squares
steps:
  - name: read
    use: numbers
    config: { count: 100 }
  - name: square
    use: square
    inputs: [read]
    copies: 3
  - name: sink
    use: collect
    inputs: [square]
resources:
  row_buffer_size: 4
state:
  backend: none
"#,
    );
    let result = run_pipeline(&config, &h.registry, &ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(collected_values(&h), (0..100).collect::<Vec<_>>());
    assert_eq!(result.steps.len(), 5);
    assert!(result.steps.iter().all(|s| s.outcome == InstanceOutcome::Completed));
    assert_eq!(result.step_totals("read").lines_input, 100);
    assert_eq!(result.step_totals("square").lines_read, 100);
    assert_eq!(result.step_totals("square").lines_written, 100);
    assert_eq!(result.step_totals("sink").lines_read, 100);
    // One derivation per instance, regardless of row count.
    assert_eq!(h.derivations.load(Ordering::SeqCst), 3);

    let rows = h.collected.lock().unwrap();
    let (schema, row) = rows.iter().find(|(_, r)| r[0] == Value::Integer(7)).unwrap();
    assert_eq!(schema.names().collect::<Vec<_>>(), vec!["n", "square"]);
    assert_eq!(row[1], Value::Integer(49));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routed_row_becomes_error_record_and_run_succeeds() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: isolation
steps:
  - name: read
    use: numbers
    config: { count: 20 }
  - name: square
    use: square
    inputs: [read]
    error_handling: {}
    config: { reject: 5 }
  - name: sink
    use: collect
    inputs: [square]
state:
  backend: none
"#,
    );
    let result = run_pipeline(&config, &h.registry, &ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    let values = collected_values(&h);
    assert_eq!(values.len(), 19);
    assert!(!values.contains(&5));
    assert_eq!(result.error_records.len(), 1);
    let record = &result.error_records[0];
    assert_eq!(record.error_code, "REJECTED");
    assert_eq!(record.step_name, "square");
    assert_eq!(record.origin_field.as_deref(), Some("n"));
    assert_eq!(record.record_json, r#"{"n":5}"#);
    assert_eq!(result.step_totals("square").lines_rejected, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routed_rows_reach_error_target_step() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: isolation
steps:
  - name: read
    use: numbers
    config: { count: 10 }
  - name: square
    use: square
    inputs: [read]
    error_handling:
      target: rejected
      description_field: error_description
      codes_field: error_codes
    config: { reject: 3 }
  - name: rejected
    use: collect
state:
  backend: none
"#,
    );
    let result = run_pipeline(&config, &h.registry, &ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.error_records.is_empty());
    let rows = h.collected.lock().unwrap();
    assert_eq!(rows.len(), 1);
    let (schema, row) = &rows[0];
    assert_eq!(
        schema.names().collect::<Vec<_>>(),
        vec!["n", "error_description", "error_codes"]
    );
    assert_eq!(row[0], Value::Integer(3));
    assert_eq!(row[1], Value::from("value 3 is rejected"));
    assert_eq!(row[2], Value::from("REJECTED"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unrouted_row_failure_fails_the_run() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: strict
steps:
  - name: read
    use: numbers
    config: { count: 100000 }
  - name: square
    use: square
    inputs: [read]
    config: { reject: 5 }
  - name: sink
    use: collect
    inputs: [square]
resources:
  row_buffer_size: 2
state:
  backend: none
"#,
    );
    let err = run_pipeline(&config, &h.registry, &ExecutionOptions::default())
        .await
        .unwrap_err();

    let PipelineError::Transform(error) = err else {
        panic!("expected transform error");
    };
    assert_eq!(error.code, "REJECTED");
    assert!(collected_values(&h).iter().all(|n| *n < 5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn max_errors_turns_routing_fatal() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: limited
steps:
  - name: read
    use: numbers
    config: { count: 10 }
  - name: square
    use: square
    inputs: [read]
    error_handling: { max_errors: 0 }
    config: { reject: 2 }
state:
  backend: none
"#,
    );
    let err = run_pipeline(&config, &h.registry, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.as_transform_error().unwrap().code, "MAX_ERRORS_EXCEEDED");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operator_stop_reports_stopped() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: endless
steps:
  - name: read
    use: numbers
    config: { count: 9223372036854775807 }
  - name: square
    use: square
    inputs: [read]
resources:
  row_buffer_size: 8
state:
  backend: none
"#,
    );
    let stop = CancellationToken::new();
    let options = ExecutionOptions::default().with_cancel(stop.clone());
    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
    });
    let result = run_pipeline(&config, &h.registry, &options).await.unwrap();
    trigger.await.unwrap();

    assert_eq!(result.status, RunStatus::Stopped);
    assert!(result
        .steps
        .iter()
        .all(|s| s.outcome == InstanceOutcome::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operator_stop_closes_every_open_file_once() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: endless-files
steps:
  - name: read
    use: numbers
    config: { count: 9223372036854775807 }
  - name: write
    use: memory-lines
    inputs: [read]
    config: { name: /out/n, split_every: 5 }
resources:
  row_buffer_size: 4
state:
  backend: none
"#,
    );
    let stop = CancellationToken::new();
    let options = ExecutionOptions::default().with_cancel(stop.clone());
    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
    });
    let result = run_pipeline(&config, &h.registry, &options).await.unwrap();
    trigger.await.unwrap();

    assert_eq!(result.status, RunStatus::Stopped);
    assert!(result
        .steps
        .iter()
        .all(|s| s.outcome == InstanceOutcome::Cancelled));

    let opens = h.memory.open_count();
    assert!(opens >= 1);
    assert_eq!(h.memory.close_count(), opens);
    let closes = h.memory.closes_by_path();
    assert_eq!(closes.len(), opens);
    assert!(closes.iter().all(|(_, n)| *n == 1), "{closes:?}");
    assert_eq!(h.memory.files().len(), opens);
    // Only the handle open at the stop can be short.
    let written = result.step_totals("write").lines_output;
    assert!(written <= 5 * opens as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dry_run_reports_split_files_in_memory() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: files
variables:
  OUT: /nonexistent/rowpipe
steps:
  - name: read
    use: numbers
    config: { count: 10 }
  - name: write
    use: lines
    inputs: [read]
    config: { name: "${OUT}/n", split_every: 4 }
"#,
    );
    let result = run_pipeline(&config, &h.registry, &ExecutionOptions::dry_run())
        .await
        .unwrap();

    let files: Vec<(String, u64)> = result
        .dry_run_files
        .iter()
        .map(|(p, size)| (p.to_string_lossy().into_owned(), *size))
        .collect();
    assert_eq!(
        files,
        vec![
            ("/nonexistent/rowpipe/n_0.txt".to_string(), 8),
            ("/nonexistent/rowpipe/n_1.txt".to_string(), 8),
            ("/nonexistent/rowpipe/n_2.txt".to_string(), 4),
        ]
    );
    assert_eq!(result.result_files.len(), 3);
    assert!(result.run_id.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lazy_open_creates_no_file_without_rows() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    for (lazy, expected) in [(true, false), (false, true)] {
        let yaml = format!(
            r#"
version: "1.0"
pipeline: files
steps:
  - name: read
    use: numbers
    config: {{ count: 0 }}
  - name: write
    use: lines
    inputs: [read]
    config: {{ name: "{}/lazy_{lazy}", split_every: 0, lazy_open: {lazy} }}
state:
  backend: none
"#,
            dir.path().display()
        );
        let result = run_pipeline(&pipeline(&yaml), &h.registry, &ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        let path = dir.path().join(format!("lazy_{lazy}.txt"));
        assert_eq!(path.exists(), expected, "lazy_open = {lazy}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_are_recorded_in_state_store() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
version: "1.0"
pipeline: recorded
steps:
  - name: read
    use: numbers
    config: {{ count: 3 }}
  - name: square
    use: square
    inputs: [read]
    error_handling: {{}}
    config: {{ reject: 1 }}
state:
  backend: sqlite
  connection: {}
"#,
        dir.path().join("state.db").display()
    );
    let config = pipeline(&yaml);
    let first = run_pipeline(&config, &h.registry, &ExecutionOptions::default())
        .await
        .unwrap();
    let second = run_pipeline(&config, &h.registry, &ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(first.run_id, Some(1));
    assert_eq!(second.run_id, Some(2));
    assert_eq!(second.error_records.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_graph_is_rejected_before_running() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: broken
steps:
  - name: square
    use: square
    inputs: [nowhere]
state:
  backend: none
"#,
    );
    let err = run_pipeline(&config, &h.registry, &ExecutionOptions::default())
        .await
        .unwrap_err();
    let error = err.as_transform_error().unwrap();
    assert_eq!(error.code, "INVALID_PIPELINE");
    assert!(error.message.contains("unknown input 'nowhere'"));
    assert_eq!(h.derivations.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_step_config_fails_before_any_row() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: broken
steps:
  - name: read
    use: numbers
    config: { count: "many" }
state:
  backend: none
"#,
    );
    let err = run_pipeline(&config, &h.registry, &ExecutionOptions::default())
        .await
        .unwrap_err();
    let error = err.as_transform_error().unwrap();
    assert_eq!(error.code, "INVALID_CONFIG");
    assert!(error.message.starts_with("step 'read':"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn check_collects_step_validations() {
    let h = harness();
    let config = pipeline(
        r#"
version: "1.0"
pipeline: checked
steps:
  - name: read
    use: numbers
    config: { count: 1 }
  - name: square
    use: square
    inputs: [read]
    config: { reject: -1 }
  - name: mystery
    use: unknown
    inputs: [read]
state:
  backend: none
"#,
    );
    let check = check_pipeline(&config, &h.registry).await.unwrap();
    assert!(!check.is_ok());
    assert!(check
        .pipeline_errors
        .as_deref()
        .unwrap()
        .contains("unknown transform 'unknown'"));
    assert_eq!(check.steps.len(), 3);
    assert_eq!(check.steps[0].1.status, ValidationStatus::Success);
    assert_eq!(check.steps[1].1.status, ValidationStatus::Failed);
    assert_eq!(check.steps[2].1.status, ValidationStatus::Failed);
    assert!(check.state_ok);
}
