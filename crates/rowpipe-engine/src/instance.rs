//! Runtime unit driving one copy of one step.
//!
//! Lifecycle: `Created → Initialized → Running → Draining → Disposed`.
//! [`TransformInstance::execute`] runs the whole cycle on the calling
//! (blocking) thread. `dispose` runs exactly once on every path, including a
//! failed `init` and a dropped instance. A fatal error cancels the pipeline
//! token so every other instance stops at its next suspension point.

use std::sync::Arc;
use std::time::Instant;

use rowpipe_types::error::TransformError;
use rowpipe_types::metric::CounterSnapshot;
use rowpipe_types::schema::RowSchema;
use rowpipe_types::value::Row;
use tokio_util::sync::CancellationToken;

use crate::channel::{Pulled, Pushed, RowOutput, RowReceiver};
use crate::error_router::ErrorRouter;
use crate::transform::{RowOutcome, Step, StepContext};

/// Default number of rows between progress log lines.
pub const DEFAULT_FEEDBACK_SIZE: u64 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Initialized,
    Running,
    Draining,
    Disposed,
}

/// How an instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    /// Input exhausted and end of stream sent downstream.
    Completed,
    /// Stopped by the pipeline token before the input was exhausted.
    Cancelled,
    /// A downstream step stopped reading while the token was still live.
    DownstreamClosed,
    Failed(TransformError),
}

/// Final account of one instance.
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub step_name: String,
    pub copy: usize,
    pub outcome: InstanceOutcome,
    pub counters: CounterSnapshot,
    pub finished_at: Instant,
    pub duration_secs: f64,
}

enum RunEnd {
    Completed,
    Cancelled,
    DownstreamClosed,
}

pub struct TransformInstance {
    ctx: StepContext,
    step: Step,
    state: InstanceState,
    input: Option<RowReceiver>,
    output: RowOutput,
    errors: ErrorRouter,
    cancel: CancellationToken,
    feedback_size: u64,
    input_schema: Option<Arc<RowSchema>>,
    output_schema: Option<Arc<RowSchema>>,
}

impl TransformInstance {
    #[must_use]
    pub fn new(
        ctx: StepContext,
        step: Step,
        input: Option<RowReceiver>,
        output: RowOutput,
        errors: ErrorRouter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            step,
            state: InstanceState::Created,
            input,
            output,
            errors,
            cancel,
            feedback_size: DEFAULT_FEEDBACK_SIZE,
            input_schema: None,
            output_schema: None,
        }
    }

    #[must_use]
    pub fn with_feedback_size(mut self, feedback_size: u64) -> Self {
        self.feedback_size = feedback_size;
        self
    }

    #[must_use]
    pub fn state(&self) -> InstanceState {
        self.state
    }

    #[must_use]
    pub fn context(&self) -> &StepContext {
        &self.ctx
    }

    /// Output layout, once derived.
    #[must_use]
    pub fn output_schema(&self) -> Option<&Arc<RowSchema>> {
        self.output_schema.as_ref()
    }

    /// Run init, the row loop and dispose, and report the outcome.
    pub fn execute(mut self) -> InstanceReport {
        let started = Instant::now();
        tracing::debug!(step = self.ctx.step_name(), copy = self.ctx.copy(), "Starting instance");

        let outcome = match self.init().and_then(|()| self.run()) {
            Ok(RunEnd::Completed) => InstanceOutcome::Completed,
            Ok(RunEnd::Cancelled) => InstanceOutcome::Cancelled,
            Ok(RunEnd::DownstreamClosed) => {
                tracing::warn!(
                    step = self.ctx.step_name(),
                    copy = self.ctx.copy(),
                    "Downstream stopped reading, stopping pipeline"
                );
                self.cancel.cancel();
                InstanceOutcome::DownstreamClosed
            }
            Err(error) => {
                self.fail(&error);
                InstanceOutcome::Failed(error)
            }
        };
        self.dispose();

        let counters = self.ctx.counters().snapshot();
        tracing::info!(
            step = self.ctx.step_name(),
            copy = self.ctx.copy(),
            lines_read = counters.lines_read,
            lines_written = counters.lines_written,
            lines_input = counters.lines_input,
            lines_output = counters.lines_output,
            lines_rejected = counters.lines_rejected,
            errors = counters.errors,
            outcome = ?outcome,
            "Instance finished"
        );
        InstanceReport {
            step_name: self.ctx.step_name().to_string(),
            copy: self.ctx.copy(),
            outcome,
            counters,
            finished_at: Instant::now(),
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }

    fn fail(&self, error: &TransformError) {
        self.ctx.counters().increment_errors();
        tracing::error!(
            step = self.ctx.step_name(),
            copy = self.ctx.copy(),
            category = %error.category,
            code = %error.code,
            "Fatal error, stopping pipeline: {}",
            error.message
        );
        self.cancel.cancel();
    }

    /// Validate configuration and acquire pre-opened resources.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the run.
    pub fn init(&mut self) -> Result<(), TransformError> {
        if self.state != InstanceState::Created {
            return Err(TransformError::internal(
                "INVALID_STATE",
                format!("init called in state {:?}", self.state),
            ));
        }
        self.step.init(&self.ctx)?;
        self.state = InstanceState::Initialized;
        Ok(())
    }

    fn run(&mut self) -> Result<RunEnd, TransformError> {
        self.state = InstanceState::Running;
        let end = if matches!(self.step, Step::Source(_)) {
            self.run_source()?
        } else {
            self.run_transform()?
        };
        if !matches!(end, RunEnd::Completed) {
            return Ok(end);
        }

        self.state = InstanceState::Draining;
        if let Step::Transform(transform) = &mut self.step {
            transform.finish(&self.ctx)?;
        }
        if self.output.end(&self.cancel) == Pushed::Cancelled {
            return Ok(RunEnd::Cancelled);
        }
        self.errors.end(&self.cancel);
        Ok(RunEnd::Completed)
    }

    fn run_source(&mut self) -> Result<RunEnd, TransformError> {
        let Step::Source(source) = &mut self.step else {
            return Err(TransformError::internal("NOT_A_SOURCE", "step has no external input"));
        };
        let schema = Arc::new(source.derive_output_schema(&self.ctx)?);
        self.output_schema = Some(Arc::clone(&schema));

        let mut processed = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunEnd::Cancelled);
            }
            let Step::Source(source) = &mut self.step else {
                return Err(TransformError::internal("NOT_A_SOURCE", "step has no external input"));
            };
            let Some(outcome) = source.next_row(&schema, &self.ctx)? else {
                return Ok(RunEnd::Completed);
            };
            if let Some(end) = self.handle_outcome(outcome, &schema, &schema)? {
                return Ok(end);
            }
            processed += 1;
            self.feedback(processed);
        }
    }

    fn run_transform(&mut self) -> Result<RunEnd, TransformError> {
        let mut processed = 0u64;
        loop {
            let Some(input) = self.input.as_mut() else {
                return Err(TransformError::internal(
                    "NO_INPUT",
                    format!("step '{}' has no input channel", self.ctx.step_name()),
                ));
            };
            let (schema, row) = match input.pull(&self.cancel) {
                Pulled::Row(schema, row) => (schema, row),
                Pulled::End => return Ok(RunEnd::Completed),
                Pulled::Cancelled => return Ok(RunEnd::Cancelled),
            };
            self.ctx.counters().increment_lines_read();

            let (input_schema, output_schema) = self.first_row_setup(&schema)?;
            let Step::Transform(transform) = &mut self.step else {
                return Err(TransformError::internal("NOT_A_TRANSFORM", "step has no row input"));
            };
            let outcome = transform.process_row(row, &self.ctx);
            if let Some(end) = self.handle_outcome(outcome, &input_schema, &output_schema)? {
                return Ok(end);
            }
            processed += 1;
            self.feedback(processed);
        }
    }

    /// Derive the output layout on the first row; afterwards check that
    /// every row keeps the first row's layout.
    ///
    /// Derivation happens once per instance, so every producer feeding a step
    /// must agree on one layout. A step that takes both data rows and routed
    /// error rows only works when the routed rows add no error fields.
    fn first_row_setup(
        &mut self,
        schema: &Arc<RowSchema>,
    ) -> Result<(Arc<RowSchema>, Arc<RowSchema>), TransformError> {
        if let (Some(input), Some(output)) = (&self.input_schema, &self.output_schema) {
            if !Arc::ptr_eq(input, schema) && **input != **schema {
                return Err(TransformError::config(
                    "MIXED_LAYOUT",
                    format!(
                        "step '{}' received rows with different layouts: [{}] then [{}]; \
                         all producers of a step must share one layout",
                        self.ctx.step_name(),
                        input.names().collect::<Vec<_>>().join(", "),
                        schema.names().collect::<Vec<_>>().join(", ")
                    ),
                ));
            }
            return Ok((Arc::clone(input), Arc::clone(output)));
        }

        let Step::Transform(transform) = &mut self.step else {
            return Err(TransformError::internal("NOT_A_TRANSFORM", "step has no row input"));
        };
        let output = Arc::new(transform.derive_output_schema(schema, &self.ctx)?);
        transform.on_first_row(schema, &output, &self.ctx)?;
        tracing::debug!(
            step = self.ctx.step_name(),
            copy = self.ctx.copy(),
            input_fields = schema.len(),
            output_fields = output.len(),
            "Derived output layout"
        );
        self.input_schema = Some(Arc::clone(schema));
        self.output_schema = Some(Arc::clone(&output));
        Ok((Arc::clone(schema), output))
    }

    /// Push emitted rows or route a failure. Returns `Some` when the loop
    /// must stop.
    fn handle_outcome(
        &mut self,
        outcome: RowOutcome,
        input_schema: &Arc<RowSchema>,
        output_schema: &Arc<RowSchema>,
    ) -> Result<Option<RunEnd>, TransformError> {
        match outcome {
            RowOutcome::Emit(rows) => {
                for row in rows {
                    match self.output.push(output_schema, row, &self.cancel) {
                        Pushed::Sent => self.ctx.counters().increment_lines_written(),
                        pushed => return Ok(Some(self.stopped_by(pushed))),
                    }
                }
                Ok(None)
            }
            RowOutcome::Failed { row, error } => {
                match self
                    .errors
                    .route(&self.ctx, input_schema, row, error, &self.cancel)?
                {
                    Pushed::Sent => Ok(None),
                    pushed => Ok(Some(self.stopped_by(pushed))),
                }
            }
        }
    }

    /// A closed queue only counts as a stop when the token already fired.
    fn stopped_by(&self, pushed: Pushed) -> RunEnd {
        if pushed == Pushed::Closed && !self.cancel.is_cancelled() {
            RunEnd::DownstreamClosed
        } else {
            RunEnd::Cancelled
        }
    }

    fn feedback(&self, processed: u64) {
        if self.feedback_size > 0 && processed % self.feedback_size == 0 {
            let counters = self.ctx.counters();
            tracing::info!(
                step = self.ctx.step_name(),
                copy = self.ctx.copy(),
                lines_read = counters.lines_read(),
                lines_input = counters.lines_input(),
                lines_output = counters.lines_output(),
                lines_rejected = counters.lines_rejected(),
                "Progress"
            );
        }
    }

    /// Release resources and senders. Idempotent.
    pub fn dispose(&mut self) {
        if self.state == InstanceState::Disposed {
            return;
        }
        if let Err(error) = self.step.dispose(&self.ctx) {
            self.ctx.counters().increment_errors();
            tracing::error!(
                step = self.ctx.step_name(),
                copy = self.ctx.copy(),
                code = %error.code,
                "Failed to release resources: {}",
                error.message
            );
        }
        self.output.close();
        self.errors.close();
        self.input = None;
        self.state = InstanceState::Disposed;
    }
}

impl Drop for TransformInstance {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for TransformInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformInstance")
            .field("step", &self.ctx.step_name())
            .field("copy", &self.ctx.copy())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Helper for tests and sources: a row from anything convertible to values.
#[must_use]
pub fn row_of<I, V>(values: I) -> Row
where
    I: IntoIterator<Item = V>,
    V: Into<rowpipe_types::value::Value>,
{
    Row::new(values.into_iter().map(Into::into).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{row_channel, Downstream, Frame};
    use crate::error_router::{ErrorCollector, ErrorHandlingConfig, ErrorSink};
    use crate::resource::MemoryTarget;
    use crate::transform::{Source, Transform};
    use rowpipe_types::schema::{FieldDescriptor, ValueType};
    use rowpipe_types::value::Value;
    use rowpipe_types::variables::VariableSpace;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Probe {
        derives: AtomicUsize,
        first_rows: AtomicUsize,
        disposes: AtomicUsize,
    }

    /// Doubles `n`; fails on the configured value.
    struct Doubler {
        probe: Arc<Probe>,
        fail_on: Option<i64>,
        fail_init: bool,
    }

    impl Transform for Doubler {
        fn init(&mut self, _ctx: &StepContext) -> Result<(), TransformError> {
            if self.fail_init {
                return Err(TransformError::config("BAD_INIT", "init refused"));
            }
            Ok(())
        }

        fn derive_output_schema(
            &self,
            input: &RowSchema,
            ctx: &StepContext,
        ) -> Result<RowSchema, TransformError> {
            self.probe.derives.fetch_add(1, Ordering::SeqCst);
            let mut out = input.clone();
            out.push(FieldDescriptor::new("doubled", ValueType::Integer, ctx.step_name()))?;
            Ok(out)
        }

        fn on_first_row(
            &mut self,
            _input: &RowSchema,
            _output: &RowSchema,
            _ctx: &StepContext,
        ) -> Result<(), TransformError> {
            self.probe.first_rows.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn process_row(&mut self, mut row: Row, _ctx: &StepContext) -> RowOutcome {
            let Value::Integer(n) = row[0] else {
                return RowOutcome::failed(row, TransformError::data("NOT_INT", "n"));
            };
            if Some(n) == self.fail_on {
                return RowOutcome::failed(
                    row,
                    TransformError::data("BAD_ROW", format!("row {n} rejected")).with_field("n"),
                );
            }
            row.push(Value::Integer(n * 2));
            RowOutcome::one(row)
        }

        fn dispose(&mut self, _ctx: &StepContext) -> Result<(), TransformError> {
            self.probe.disposes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Counter {
        next: i64,
        until: i64,
    }

    impl Source for Counter {
        fn derive_output_schema(&self, ctx: &StepContext) -> Result<RowSchema, TransformError> {
            RowSchema::from_fields(vec![FieldDescriptor::new("n", ValueType::Integer, ctx.step_name())])
        }

        fn next_row(
            &mut self,
            _output: &RowSchema,
            ctx: &StepContext,
        ) -> Result<Option<RowOutcome>, TransformError> {
            if self.next >= self.until {
                return Ok(None);
            }
            ctx.counters().increment_lines_input();
            let row = row_of([self.next]);
            self.next += 1;
            Ok(Some(RowOutcome::one(row)))
        }
    }

    fn ctx(name: &str) -> StepContext {
        StepContext::new(
            name,
            0,
            Arc::new(VariableSpace::new()),
            Arc::new(MemoryTarget::new()),
        )
    }

    fn doubler(probe: &Arc<Probe>, fail_on: Option<i64>) -> Step {
        Step::Transform(Box::new(Doubler {
            probe: Arc::clone(probe),
            fail_on,
            fail_init: false,
        }))
    }

    fn source_instance(
        until: i64,
        tx: tokio::sync::mpsc::Sender<crate::channel::Frame>,
        cancel: &CancellationToken,
    ) -> TransformInstance {
        TransformInstance::new(
            ctx("gen"),
            Step::Source(Box::new(Counter { next: 0, until })),
            None,
            RowOutput::new(vec![Downstream::new("double", vec![tx])]),
            ErrorRouter::disabled(),
            cancel.clone(),
        )
    }

    /// Run `gen(0..rows) → double → sink` and return the reports plus rows
    /// that reached the sink.
    async fn run_chain(
        rows: i64,
        transform: Step,
        errors: ErrorRouter,
    ) -> (InstanceReport, InstanceReport, Vec<Row>) {
        let cancel = CancellationToken::new();
        let (src_tx, src_rx) = row_channel(4, 1);
        let (out_tx, mut out_rx) = row_channel(4, 1);

        let source = source_instance(rows, src_tx, &cancel);
        let middle = TransformInstance::new(
            ctx("double"),
            transform,
            Some(src_rx),
            RowOutput::new(vec![Downstream::new("sink", vec![out_tx])]),
            errors,
            cancel.clone(),
        );

        let source_task = tokio::task::spawn_blocking(move || source.execute());
        let middle_task = tokio::task::spawn_blocking(move || middle.execute());
        // The sink drains until every sender is gone, even after a stop.
        let sink_cancel = CancellationToken::new();
        let sink_task = tokio::task::spawn_blocking(move || {
            let mut rows = Vec::new();
            while let Pulled::Row(_, row) = out_rx.pull(&sink_cancel) {
                rows.push(row);
            }
            rows
        });
        let middle_report = middle_task.await.unwrap();
        let source_report = source_task.await.unwrap();
        let received = sink_task.await.unwrap();
        (source_report, middle_report, received)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chain_completes_and_derives_once() {
        let probe = Arc::new(Probe::default());
        let (source, middle, rows) =
            run_chain(25, doubler(&probe, None), ErrorRouter::disabled()).await;

        assert_eq!(source.outcome, InstanceOutcome::Completed);
        assert_eq!(middle.outcome, InstanceOutcome::Completed);
        assert_eq!(rows.len(), 25);
        assert_eq!(rows[7], row_of([7_i64, 14]));
        assert_eq!(probe.derives.load(Ordering::SeqCst), 1);
        assert_eq!(probe.first_rows.load(Ordering::SeqCst), 1);
        assert_eq!(probe.disposes.load(Ordering::SeqCst), 1);
        assert_eq!(source.counters.lines_input, 25);
        assert_eq!(middle.counters.lines_read, 25);
        assert_eq!(middle.counters.lines_written, 25);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn routed_failure_keeps_the_run_going() {
        let probe = Arc::new(Probe::default());
        let collector = ErrorCollector::new();
        let router = ErrorRouter::new(
            ErrorHandlingConfig::default(),
            ErrorSink::Collector(collector.clone()),
        );
        let (_, middle, rows) = run_chain(10, doubler(&probe, Some(4)), router).await;

        assert_eq!(middle.outcome, InstanceOutcome::Completed);
        assert_eq!(rows.len(), 9);
        assert!(rows.iter().all(|r| r[0] != Value::Integer(4)));
        let records = collector.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error_code, "BAD_ROW");
        assert_eq!(records[0].row, row_of([4_i64]));
        assert_eq!(middle.counters.lines_rejected, 1);
        assert_eq!(middle.counters.errors, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unrouted_failure_stops_everything() {
        let probe = Arc::new(Probe::default());
        let (source, middle, rows) =
            run_chain(1_000, doubler(&probe, Some(3)), ErrorRouter::disabled()).await;

        let InstanceOutcome::Failed(error) = &middle.outcome else {
            panic!("expected failure, got {:?}", middle.outcome);
        };
        assert_eq!(error.code, "BAD_ROW");
        assert_eq!(rows.len(), 3);
        assert_eq!(middle.counters.lines_read, 4);
        assert_eq!(middle.counters.errors, 1);
        assert_eq!(source.outcome, InstanceOutcome::Cancelled);
        assert!(source.counters.lines_input < 1_000);
        assert_eq!(probe.disposes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_init_still_disposes_once() {
        let probe = Arc::new(Probe::default());
        let cancel = CancellationToken::new();
        let (_tx, rx) = row_channel(1, 1);
        let instance = TransformInstance::new(
            ctx("double"),
            Step::Transform(Box::new(Doubler {
                probe: Arc::clone(&probe),
                fail_on: None,
                fail_init: true,
            })),
            Some(rx),
            RowOutput::terminal(),
            ErrorRouter::disabled(),
            cancel.clone(),
        );
        let report = tokio::task::spawn_blocking(move || instance.execute())
            .await
            .unwrap();
        assert!(matches!(report.outcome, InstanceOutcome::Failed(ref e) if e.code == "BAD_INIT"));
        assert!(cancel.is_cancelled());
        assert_eq!(probe.disposes.load(Ordering::SeqCst), 1);
        assert_eq!(probe.derives.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_while_waiting_disposes_without_more_rows() {
        let probe = Arc::new(Probe::default());
        let cancel = CancellationToken::new();
        let (_tx, rx) = row_channel(1, 1);
        let instance = TransformInstance::new(
            ctx("double"),
            doubler(&probe, None),
            Some(rx),
            RowOutput::terminal(),
            ErrorRouter::disabled(),
            cancel.clone(),
        );
        let task = tokio::task::spawn_blocking(move || instance.execute());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.outcome, InstanceOutcome::Cancelled);
        assert_eq!(report.counters.lines_read, 0);
        assert_eq!(probe.disposes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_downstream_is_reported_apart_from_cancel() {
        let cancel = CancellationToken::new();
        let (tx, rx) = row_channel(4, 1);
        drop(rx);
        let source = source_instance(100, tx, &cancel);
        let report = tokio::task::spawn_blocking(move || source.execute())
            .await
            .unwrap();
        assert_eq!(report.outcome, InstanceOutcome::DownstreamClosed);
        assert_eq!(report.counters.lines_input, 1);
        assert!(cancel.is_cancelled());

        let cancel = CancellationToken::new();
        let (tx, rx) = row_channel(4, 1);
        drop(rx);
        cancel.cancel();
        let source = source_instance(100, tx, &cancel);
        let report = tokio::task::spawn_blocking(move || source.execute())
            .await
            .unwrap();
        assert_eq!(report.outcome, InstanceOutcome::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_layout_on_one_input_is_fatal() {
        let probe = Arc::new(Probe::default());
        let cancel = CancellationToken::new();
        let (tx, rx) = row_channel(4, 2);
        let data = Arc::new(
            RowSchema::from_fields(vec![FieldDescriptor::new("n", ValueType::Integer, "gen")]).unwrap(),
        );
        let routed = Arc::new(
            RowSchema::from_fields(vec![
                FieldDescriptor::new("n", ValueType::Integer, "gen"),
                FieldDescriptor::new("error_codes", ValueType::String, "gen"),
            ])
            .unwrap(),
        );
        tx.try_send(Frame::Row(data, row_of([1_i64]))).unwrap();
        tx.try_send(Frame::Row(routed, row_of([Value::Integer(2), Value::from("BAD_ROW")])))
            .unwrap();

        let instance = TransformInstance::new(
            ctx("double"),
            doubler(&probe, None),
            Some(rx),
            RowOutput::terminal(),
            ErrorRouter::disabled(),
            cancel.clone(),
        );
        let report = tokio::task::spawn_blocking(move || instance.execute())
            .await
            .unwrap();
        let InstanceOutcome::Failed(error) = &report.outcome else {
            panic!("expected failure, got {:?}", report.outcome);
        };
        assert_eq!(error.code, "MIXED_LAYOUT");
        assert!(error.message.contains("[n] then [n, error_codes]"), "{}", error.message);
        assert_eq!(probe.derives.load(Ordering::SeqCst), 1);
        assert_eq!(report.counters.lines_read, 2);
        assert!(cancel.is_cancelled());
        drop(tx);
    }

    #[test]
    fn dispose_is_idempotent_and_runs_on_drop() {
        let probe = Arc::new(Probe::default());
        let mut instance = TransformInstance::new(
            ctx("double"),
            doubler(&probe, None),
            None,
            RowOutput::terminal(),
            ErrorRouter::disabled(),
            CancellationToken::new(),
        );
        assert_eq!(instance.state(), InstanceState::Created);
        instance.init().unwrap();
        assert_eq!(instance.state(), InstanceState::Initialized);
        instance.dispose();
        instance.dispose();
        assert_eq!(instance.state(), InstanceState::Disposed);
        drop(instance);
        assert_eq!(probe.disposes.load(Ordering::SeqCst), 1);

        let dropped = TransformInstance::new(
            ctx("double"),
            doubler(&probe, None),
            None,
            RowOutput::terminal(),
            ErrorRouter::disabled(),
            CancellationToken::new(),
        );
        drop(dropped);
        assert_eq!(probe.disposes.load(Ordering::SeqCst), 2);
    }
}
