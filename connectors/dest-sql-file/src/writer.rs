//! `sql-file-output` transform: one INSERT per row, split across files.

use rowpipe_engine::convert::java_to_strftime;
use rowpipe_engine::resource::SplitWriter;
use rowpipe_engine::transform::{RowOutcome, StepContext, Transform};
use rowpipe_types::error::{TransformError, ValidationResult};
use rowpipe_types::schema::RowSchema;
use rowpipe_types::value::Row;
use rowpipe_types::variables::Variables;

use crate::config::Config;
use crate::sql::{SqlWriter, DEFAULT_DATE_FORMAT};

const RESULT_COMMENT: &str = "created by sql-file-output";

pub struct SqlFileOutput {
    config: Config,
    sql: Option<SqlWriter>,
    writer: Option<SplitWriter>,
    input: Option<RowSchema>,
}

impl SqlFileOutput {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sql: None,
            writer: None,
            input: None,
        }
    }

    fn write(&mut self, row: &Row, ctx: &StepContext) -> Result<(), TransformError> {
        let (Some(sql), Some(writer), Some(input)) =
            (self.sql.as_ref(), self.writer.as_mut(), self.input.as_ref())
        else {
            return Err(TransformError::internal("NOT_INITIALIZED", "writer is not initialized"));
        };

        if let Some(path) = writer.rotate_if_due(ctx.counters())? {
            tracing::debug!(step = ctx.step_name(), path = %path.display(), "Started next split");
        }
        if writer.ensure_open()?.is_some() {
            tracing::debug!(step = ctx.step_name(), "Opened output on first row");
        }

        let mut preamble = String::new();
        if self.config.create_table {
            preamble.push_str(&sql.create_table(input));
        }
        if self.config.truncate_table {
            preamble.push_str(&sql.truncate_table());
        }
        if !preamble.is_empty() {
            writer.write_preamble(ctx.counters(), &preamble)?;
        }

        let mut statement = sql.insert(input, row)?;
        if self.config.start_new_line {
            statement.push('\n');
        }
        tracing::trace!(step = ctx.step_name(), sql = %statement, "Writing statement");
        writer.write_row(&statement)
    }
}

impl Transform for SqlFileOutput {
    fn validate(&self, variables: &dyn Variables) -> ValidationResult {
        ValidationResult::from_problems(&self.config.problems(variables), "sql-file-output config is valid")
    }

    fn init(&mut self, ctx: &StepContext) -> Result<(), TransformError> {
        let table = ctx.resolve(&self.config.table_name);
        if table.trim().is_empty() {
            return Err(TransformError::config("MISSING_TABLE", "table name is required"));
        }
        let naming = self.config.naming(ctx.variables());
        if naming.base.trim().is_empty() {
            return Err(TransformError::config("MISSING_FILENAME", "output file name is required"));
        }
        let encoding = self.config.encoding(ctx.variables())?;
        let schema = self.config.schema_name.as_deref().map(|s| ctx.resolve(s));
        let date_format = self
            .config
            .date_format
            .as_deref()
            .filter(|f| !f.is_empty())
            .map_or_else(|| DEFAULT_DATE_FORMAT.to_string(), java_to_strftime);
        self.sql = Some(SqlWriter::new(
            self.config.dialect,
            schema.as_deref(),
            &table,
            date_format,
        ));

        let mut writer = SplitWriter::new(ctx.target(), naming, ctx.copy())
            .with_append(self.config.file.append)
            .with_encoding(encoding);
        if self.config.file.create_parent_folder {
            writer.create_parent_dir()?;
        }
        if !self.config.file.lazy_open {
            writer.open_next()?;
        }
        tracing::info!(
            step = ctx.step_name(),
            copy = ctx.copy(),
            table = self.sql.as_ref().map(SqlWriter::qualified_table),
            path = %writer.next_path().display(),
            lazy_open = self.config.file.lazy_open,
            "SQL file output initialized"
        );
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

    fn on_first_row(
        &mut self,
        input: &RowSchema,
        _output: &RowSchema,
        _ctx: &StepContext,
    ) -> Result<(), TransformError> {
        self.input = Some(input.clone());
        Ok(())
    }

    fn process_row(&mut self, row: Row, ctx: &StepContext) -> RowOutcome {
        match self.write(&row, ctx) {
            Ok(()) => {
                ctx.counters().increment_lines_output();
                RowOutcome::one(row)
            }
            Err(error) if error.is_structural() => RowOutcome::failed(row, error),
            Err(error) => {
                let field = error.field.clone();
                let mut error = TransformError::data("SFO001", error.message);
                error.field = field;
                RowOutcome::failed(row, error)
            }
        }
    }

    fn dispose(&mut self, ctx: &StepContext) -> Result<(), TransformError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writer.close(ctx.counters());
        if self.config.file.add_to_result {
            for path in writer.opened_paths() {
                ctx.add_result_file(path.clone(), RESULT_COMMENT);
            }
        }
        tracing::debug!(
            step = ctx.step_name(),
            copy = ctx.copy(),
            files = writer.opened_paths().len(),
            "SQL file output closed"
        );
        Ok(())
    }
}
