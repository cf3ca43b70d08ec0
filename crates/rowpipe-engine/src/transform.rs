//! The contract every step implements.
//!
//! A [`Transform`] consumes rows from upstream; a [`Source`] produces rows
//! from an external input. Both derive their output schema exactly once per
//! run, without side effects, before the first row is handled. Row failures
//! are values ([`RowOutcome::Failed`]); the instance decides whether they are
//! routed or fatal.

use std::path::PathBuf;
use std::sync::Arc;

use rowpipe_types::error::{TransformError, ValidationResult};
use rowpipe_types::schema::RowSchema;
use rowpipe_types::value::Row;
use rowpipe_types::variables::Variables;

use crate::counters::TransformCounters;
use crate::resource::{OutputTarget, ResultFile, ResultFiles};

/// Result of handling one row.
#[derive(Debug)]
pub enum RowOutcome {
    /// Zero or more rows to push downstream, in order.
    Emit(Vec<Row>),
    /// The row could not be processed.
    Failed { row: Row, error: TransformError },
}

impl RowOutcome {
    #[must_use]
    pub fn one(row: Row) -> Self {
        Self::Emit(vec![row])
    }

    /// Drop the row without output.
    #[must_use]
    pub fn skip() -> Self {
        Self::Emit(Vec::new())
    }

    #[must_use]
    pub fn failed(row: Row, error: TransformError) -> Self {
        Self::Failed { row, error }
    }
}

/// Everything a step may use besides its own configuration.
#[derive(Clone)]
pub struct StepContext {
    step_name: String,
    copy: usize,
    variables: Arc<dyn Variables>,
    counters: Arc<TransformCounters>,
    target: Arc<dyn OutputTarget>,
    result_files: ResultFiles,
}

impl StepContext {
    #[must_use]
    pub fn new(
        step_name: impl Into<String>,
        copy: usize,
        variables: Arc<dyn Variables>,
        target: Arc<dyn OutputTarget>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            copy,
            variables,
            counters: Arc::new(TransformCounters::new()),
            target,
            result_files: ResultFiles::new(),
        }
    }

    /// Share a run-wide list of produced files.
    #[must_use]
    pub fn with_result_files(mut self, result_files: ResultFiles) -> Self {
        self.result_files = result_files;
        self
    }

    #[must_use]
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Index of this parallel copy, starting at 0.
    #[must_use]
    pub fn copy(&self) -> usize {
        self.copy
    }

    #[must_use]
    pub fn variables(&self) -> &dyn Variables {
        self.variables.as_ref()
    }

    /// Shorthand for `variables().resolve(..)`.
    #[must_use]
    pub fn resolve(&self, input: &str) -> String {
        self.variables.resolve(input)
    }

    #[must_use]
    pub fn counters(&self) -> &TransformCounters {
        &self.counters
    }

    #[must_use]
    pub fn counters_handle(&self) -> Arc<TransformCounters> {
        Arc::clone(&self.counters)
    }

    #[must_use]
    pub fn target(&self) -> Arc<dyn OutputTarget> {
        Arc::clone(&self.target)
    }

    /// Report a produced file in the run result.
    pub fn add_result_file(&self, path: PathBuf, comment: impl Into<String>) {
        self.result_files.add(ResultFile {
            path,
            step_name: self.step_name.clone(),
            comment: comment.into(),
        });
    }

    #[must_use]
    pub fn result_files(&self) -> &ResultFiles {
        &self.result_files
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("step_name", &self.step_name)
            .field("copy", &self.copy)
            .finish_non_exhaustive()
    }
}

/// Step with upstream input.
pub trait Transform: Send {
    /// Static configuration check, used by `rowpipe check`.
    fn validate(&self, _variables: &dyn Variables) -> ValidationResult {
        ValidationResult::success("ok")
    }

    /// Validate configuration and acquire resources the policy pre-opens.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the run.
    fn init(&mut self, _ctx: &StepContext) -> Result<(), TransformError> {
        Ok(())
    }

    /// Output layout for rows of layout `input`. Called once per run.
    ///
    /// # Errors
    ///
    /// Configuration errors (missing required options, duplicate names).
    fn derive_output_schema(
        &self,
        input: &RowSchema,
        ctx: &StepContext,
    ) -> Result<RowSchema, TransformError>;

    /// Setup that depends on the actual input layout. Called once, after
    /// schema derivation and before the first row.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the run.
    fn on_first_row(
        &mut self,
        _input: &RowSchema,
        _output: &RowSchema,
        _ctx: &StepContext,
    ) -> Result<(), TransformError> {
        Ok(())
    }

    fn process_row(&mut self, row: Row, ctx: &StepContext) -> RowOutcome;

    /// Called once after the last input row, before end of stream is sent.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the run.
    fn finish(&mut self, _ctx: &StepContext) -> Result<(), TransformError> {
        Ok(())
    }

    /// Release resources. Called exactly once, also after a failed `init`.
    ///
    /// # Errors
    ///
    /// Errors are counted and logged; they do not change the run outcome.
    fn dispose(&mut self, _ctx: &StepContext) -> Result<(), TransformError> {
        Ok(())
    }
}

/// Step without upstream input.
pub trait Source: Send {
    fn validate(&self, _variables: &dyn Variables) -> ValidationResult {
        ValidationResult::success("ok")
    }

    /// # Errors
    ///
    /// Any error is fatal for the run.
    fn init(&mut self, _ctx: &StepContext) -> Result<(), TransformError> {
        Ok(())
    }

    /// Output layout. Called once per run, before the first row.
    ///
    /// # Errors
    ///
    /// Configuration errors.
    fn derive_output_schema(&self, ctx: &StepContext) -> Result<RowSchema, TransformError>;

    /// Next row, or `None` when the input is exhausted.
    ///
    /// # Errors
    ///
    /// Structural failures of the external input; they are fatal.
    fn next_row(
        &mut self,
        output: &RowSchema,
        ctx: &StepContext,
    ) -> Result<Option<RowOutcome>, TransformError>;

    /// Release resources. Called exactly once, also after a failed `init`.
    ///
    /// # Errors
    ///
    /// Errors are counted and logged; they do not change the run outcome.
    fn dispose(&mut self, _ctx: &StepContext) -> Result<(), TransformError> {
        Ok(())
    }
}

/// Whether a step reads from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    Source,
    Transform,
}

impl std::fmt::Display for StepRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Source => "source",
            Self::Transform => "transform",
        })
    }
}

/// A constructed step, ready to be driven by an instance.
pub enum Step {
    Source(Box<dyn Source>),
    Transform(Box<dyn Transform>),
}

impl Step {
    #[must_use]
    pub fn role(&self) -> StepRole {
        match self {
            Self::Source(_) => StepRole::Source,
            Self::Transform(_) => StepRole::Transform,
        }
    }

    #[must_use]
    pub fn validate(&self, variables: &dyn Variables) -> ValidationResult {
        match self {
            Self::Source(s) => s.validate(variables),
            Self::Transform(t) => t.validate(variables),
        }
    }

    pub(crate) fn init(&mut self, ctx: &StepContext) -> Result<(), TransformError> {
        match self {
            Self::Source(s) => s.init(ctx),
            Self::Transform(t) => t.init(ctx),
        }
    }

    pub(crate) fn dispose(&mut self, ctx: &StepContext) -> Result<(), TransformError> {
        match self {
            Self::Source(s) => s.dispose(ctx),
            Self::Transform(t) => t.dispose(ctx),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Step({})", self.role())
    }
}
