//! Row handling for `regex-eval`.

use regex::Regex;
use rowpipe_engine::convert::convert_text;
use rowpipe_engine::transform::{RowOutcome, StepContext, Transform};
use rowpipe_types::error::{TransformError, ValidationResult};
use rowpipe_types::schema::{FieldDescriptor, RowSchema, ValueType};
use rowpipe_types::value::{Row, Value};
use rowpipe_types::variables::Variables;

use crate::config::Config;

/// Capture group target resolved against the output layout.
#[derive(Debug, Clone)]
struct GroupTarget {
    /// Capture group number, starting at 1.
    group: usize,
    index: usize,
    descriptor: FieldDescriptor,
    null_if: Option<String>,
    if_null: Option<String>,
}

/// Layout-dependent state computed on the first row.
#[derive(Debug, Clone)]
struct Bound {
    matcher: usize,
    result: usize,
    width: usize,
    targets: Vec<GroupTarget>,
}

pub struct RegexEval {
    config: Config,
    regex: Option<Regex>,
    bound: Option<Bound>,
}

impl RegexEval {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            regex: None,
            bound: None,
        }
    }

    fn result_name(&self, ctx: &StepContext) -> Result<String, TransformError> {
        let name = ctx.resolve(&self.config.result_field);
        if name.trim().is_empty() {
            return Err(TransformError::config(
                "MISSING_RESULT_FIELD",
                "result field name is required",
            ));
        }
        Ok(name)
    }

    /// Evaluate one value. `Ok(None)` means no match.
    fn evaluate(&self, text: &str) -> Result<Option<Vec<(usize, Value)>>, TransformError> {
        let (Some(regex), Some(bound)) = (self.regex.as_ref(), self.bound.as_ref()) else {
            return Err(TransformError::internal("NOT_INITIALIZED", "pattern is not compiled"));
        };
        let Some(captures) = regex.captures(text) else {
            return Ok(None);
        };
        let mut values = Vec::with_capacity(bound.targets.len());
        for target in &bound.targets {
            let raw = captures.get(target.group).map(|m| m.as_str());
            let value = convert_text(
                &target.descriptor,
                raw,
                target.null_if.as_deref(),
                target.if_null.as_deref(),
            )?;
            values.push((target.index, value));
        }
        Ok(Some(values))
    }
}

impl Transform for RegexEval {
    fn validate(&self, variables: &dyn Variables) -> ValidationResult {
        ValidationResult::from_problems(&self.config.problems(variables), "regex-eval config is valid")
    }

    fn init(&mut self, ctx: &StepContext) -> Result<(), TransformError> {
        if ctx.resolve(&self.config.matcher).trim().is_empty() {
            return Err(TransformError::config(
                "MISSING_MATCHER",
                "no field to evaluate (matcher) is set",
            ));
        }
        self.regex = Some(self.config.compile(ctx.variables())?);
        Ok(())
    }

    fn derive_output_schema(
        &self,
        input: &RowSchema,
        ctx: &StepContext,
    ) -> Result<RowSchema, TransformError> {
        let origin = ctx.step_name();
        let replace = self.config.replace_fields;
        let mut output = input.clone();
        output.append_or_replace(
            FieldDescriptor::new(self.result_name(ctx)?, ValueType::Boolean, origin),
            replace,
        )?;
        if self.config.allow_capture_groups {
            for spec in self.config.fields.iter() {
                let name = ctx.resolve(&spec.name);
                if name.is_empty() {
                    continue;
                }
                output.append_or_replace(spec.to_descriptor(name, origin), replace)?;
            }
        }
        Ok(output)
    }

    fn on_first_row(
        &mut self,
        input: &RowSchema,
        output: &RowSchema,
        ctx: &StepContext,
    ) -> Result<(), TransformError> {
        let matcher_name = ctx.resolve(&self.config.matcher);
        let matcher = input.index_of(&matcher_name).ok_or_else(|| {
            TransformError::config(
                "MATCHER_NOT_FOUND",
                format!("field to evaluate '{matcher_name}' is not in the input row"),
            )
            .with_field(matcher_name.clone())
        })?;
        let result_name = self.result_name(ctx)?;
        let result = output.index_of(&result_name).ok_or_else(|| {
            TransformError::internal("RESULT_FIELD_MISSING", "result field missing from output")
        })?;

        let mut targets = Vec::new();
        if self.config.allow_capture_groups {
            let groups = self
                .regex
                .as_ref()
                .map_or(0, |re| re.captures_len().saturating_sub(1));
            if groups != self.config.fields.len() {
                return Err(TransformError::config(
                    "GROUP_COUNT_MISMATCH",
                    format!(
                        "pattern has {groups} capture groups but {} target fields are configured",
                        self.config.fields.len()
                    ),
                ));
            }
            for (i, spec) in self.config.fields.iter().enumerate() {
                let name = ctx.resolve(&spec.name);
                if name.is_empty() {
                    continue;
                }
                let index = output.index_of(&name).ok_or_else(|| {
                    TransformError::internal("TARGET_FIELD_MISSING", format!("'{name}' missing from output"))
                })?;
                let descriptor = output.field(index).cloned().ok_or_else(|| {
                    TransformError::internal("TARGET_FIELD_MISSING", format!("'{name}' missing from output"))
                })?;
                targets.push(GroupTarget {
                    group: i + 1,
                    index,
                    descriptor,
                    null_if: spec.null_if.as_deref().map(|s| ctx.resolve(s)),
                    if_null: spec.if_null.as_deref().map(|s| ctx.resolve(s)),
                });
            }
        }

        tracing::debug!(
            step = ctx.step_name(),
            matcher = %matcher_name,
            groups = targets.len(),
            "Bound regex evaluation to input layout"
        );
        self.bound = Some(Bound {
            matcher,
            result,
            width: output.len(),
            targets,
        });
        Ok(())
    }

    fn process_row(&mut self, mut row: Row, _ctx: &StepContext) -> RowOutcome {
        let Some(bound) = self.bound.as_ref() else {
            return RowOutcome::failed(
                row,
                TransformError::internal("NOT_INITIALIZED", "first-row setup did not run"),
            );
        };
        let text = row
            .get(bound.matcher)
            .and_then(Value::as_text)
            .unwrap_or_default();

        let evaluated = match self.evaluate(&text) {
            Ok(evaluated) => evaluated,
            Err(error) if error.is_structural() => return RowOutcome::failed(row, error),
            Err(error) => {
                let field = error.field.clone();
                let mut routed = TransformError::data("REGEX001", error.message);
                if let Some(field) = field {
                    routed = routed.with_field(field);
                }
                return RowOutcome::failed(row, routed);
            }
        };

        row.resize(bound.width);
        row.set(bound.result, Value::Boolean(evaluated.is_some()));
        match evaluated {
            Some(values) => {
                for (index, value) in values {
                    row.set(index, value);
                }
            }
            None => {
                for target in &bound.targets {
                    row.set(target.index, Value::Null);
                }
            }
        }
        RowOutcome::one(row)
    }
}
