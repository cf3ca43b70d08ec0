//! Per-instance routing of failed rows.
//!
//! With error handling enabled, a row-level failure becomes an error row on
//! the configured target step, or an [`ErrorRecord`] in the run's
//! [`ErrorCollector`] when no target is named. Structural failures and
//! failures of steps without error handling are returned to the caller,
//! which stops the run.

use std::sync::{Arc, Mutex, PoisonError};

use rowpipe_types::envelope::ErrorRecord;
use rowpipe_types::error::TransformError;
use rowpipe_types::schema::{FieldDescriptor, RowSchema, ValueType};
use rowpipe_types::value::{Row, Value};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::channel::{Pushed, RowOutput};
use crate::transform::StepContext;

fn default_enabled() -> bool {
    true
}

/// `error_handling` section of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Step receiving error rows. Without it, records go to the run collector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Routed failures tolerated before the step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_errors: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nr_errors_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codes_field: Option<String>,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: None,
            max_errors: None,
            nr_errors_field: None,
            description_field: None,
            fields_field: None,
            codes_field: None,
        }
    }
}

/// Run-wide collection of error records without a target step.
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector(Arc<Mutex<Vec<ErrorRecord>>>);

impl ErrorCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: ErrorRecord) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every collected record, leaving the collector empty.
    #[must_use]
    pub fn take(&self) -> Vec<ErrorRecord> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Where routed rows go.
#[derive(Debug)]
pub enum ErrorSink {
    Step(RowOutput),
    Collector(ErrorCollector),
}

#[derive(Debug, Clone, Copy)]
enum ErrorField {
    NrErrors,
    Description,
    Fields,
    Codes,
}

#[derive(Debug)]
struct ErrorLayout {
    input: Arc<RowSchema>,
    output: Arc<RowSchema>,
    fields: Vec<(usize, ErrorField)>,
}

/// Decides what happens to a failed row.
#[derive(Debug)]
pub struct ErrorRouter {
    config: Option<ErrorHandlingConfig>,
    sink: ErrorSink,
    routed: u64,
    layout: Option<ErrorLayout>,
}

impl ErrorRouter {
    /// Router that escalates every failure.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            config: None,
            sink: ErrorSink::Collector(ErrorCollector::new()),
            routed: 0,
            layout: None,
        }
    }

    #[must_use]
    pub fn new(config: ErrorHandlingConfig, sink: ErrorSink) -> Self {
        Self {
            config: Some(config),
            sink,
            routed: 0,
            layout: None,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.enabled)
    }

    /// Route `row`, or hand back the error when it must stop the run.
    ///
    /// # Errors
    ///
    /// Returns `error` unchanged when it is structural or error handling is
    /// off, and a `MAX_ERRORS_EXCEEDED` error once the limit is passed.
    pub fn route(
        &mut self,
        ctx: &StepContext,
        schema: &Arc<RowSchema>,
        row: Row,
        error: TransformError,
        cancel: &CancellationToken,
    ) -> Result<Pushed, TransformError> {
        if error.is_structural() {
            return Err(error);
        }
        let Some(config) = self.config.as_ref().filter(|c| c.enabled) else {
            return Err(error);
        };
        let max_errors = config.max_errors;

        self.routed += 1;
        if let Some(max) = max_errors {
            if self.routed > max {
                return Err(TransformError::data(
                    "MAX_ERRORS_EXCEEDED",
                    format!(
                        "step '{}' exceeded max_errors ({max}); last error: {error}",
                        ctx.step_name()
                    ),
                ));
            }
        }

        ctx.counters().increment_lines_rejected();
        tracing::warn!(
            step = ctx.step_name(),
            copy = ctx.copy(),
            code = %error.code,
            field = error.field.as_deref(),
            "Row diverted to error output: {}",
            error.message
        );

        if let ErrorSink::Collector(collector) = &self.sink {
            collector.push(ErrorRecord::new(
                ctx.step_name(),
                ctx.copy(),
                schema,
                row,
                &error,
            ));
            return Ok(Pushed::Sent);
        }

        let (error_schema, fields) = self.layout_for(schema, ctx.step_name())?;
        let mut out = row;
        out.resize(error_schema.len());
        for (idx, field) in fields {
            let value = match field {
                ErrorField::NrErrors => Value::Integer(1),
                ErrorField::Description => Value::String(error.message.clone()),
                ErrorField::Fields => Value::from(error.field.clone()),
                ErrorField::Codes => Value::String(error.code.clone()),
            };
            out.set(idx, value);
        }
        match &mut self.sink {
            ErrorSink::Step(output) => Ok(output.push(&error_schema, out, cancel)),
            ErrorSink::Collector(_) => Ok(Pushed::Sent),
        }
    }

    fn layout_for(
        &mut self,
        input: &Arc<RowSchema>,
        origin: &str,
    ) -> Result<(Arc<RowSchema>, Vec<(usize, ErrorField)>), TransformError> {
        if let Some(layout) = &self.layout {
            if Arc::ptr_eq(&layout.input, input) {
                return Ok((Arc::clone(&layout.output), layout.fields.clone()));
            }
        }
        let config = self.config.clone().unwrap_or_default();
        let mut schema = (**input).clone();
        let mut fields = Vec::new();
        for (name, kind, value_type) in [
            (config.nr_errors_field, ErrorField::NrErrors, ValueType::Integer),
            (config.description_field, ErrorField::Description, ValueType::String),
            (config.fields_field, ErrorField::Fields, ValueType::String),
            (config.codes_field, ErrorField::Codes, ValueType::String),
        ] {
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                let idx = schema.append_or_replace(FieldDescriptor::new(name, value_type, origin), true)?;
                fields.push((idx, kind));
            }
        }
        let output = Arc::new(schema);
        self.layout = Some(ErrorLayout {
            input: Arc::clone(input),
            output: Arc::clone(&output),
            fields: fields.clone(),
        });
        Ok((output, fields))
    }

    /// Send end of stream to the error target step, if any.
    pub fn end(&mut self, cancel: &CancellationToken) {
        if let ErrorSink::Step(output) = &mut self.sink {
            output.end(cancel);
        }
    }

    pub fn close(&mut self) {
        if let ErrorSink::Step(output) = &mut self.sink {
            output.close();
        }
    }
}
