//! SQL text generation: identifiers, literals, DDL and INSERT statements.

use std::borrow::Cow;
use std::fmt::Write as _;

use pg_escape::{quote_identifier, quote_literal};
use rowpipe_types::error::TransformError;
use rowpipe_types::schema::{FieldDescriptor, RowSchema, ValueType};
use rowpipe_types::value::{Row, Value};

use crate::config::Dialect;

/// Date literal format when none is configured.
pub(crate) const DEFAULT_DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Statement builder for one table in one dialect.
#[derive(Debug, Clone)]
pub(crate) struct SqlWriter {
    dialect: Dialect,
    table: String,
    date_format: String,
}

impl SqlWriter {
    pub(crate) fn new(dialect: Dialect, schema: Option<&str>, table: &str, date_format: String) -> Self {
        let table = match schema.filter(|s| !s.trim().is_empty()) {
            Some(schema) => format!("{}.{}", quote_ident(dialect, schema), quote_ident(dialect, table)),
            None => quote_ident(dialect, table).into_owned(),
        };
        Self {
            dialect,
            table,
            date_format,
        }
    }

    pub(crate) fn qualified_table(&self) -> &str {
        &self.table
    }

    pub(crate) fn create_table(&self, schema: &RowSchema) -> String {
        let columns = schema
            .fields()
            .iter()
            .map(|f| format!("  {} {}", quote_ident(self.dialect, &f.name), column_type(self.dialect, f)))
            .collect::<Vec<_>>()
            .join(",\n");
        format!("CREATE TABLE {}\n(\n{columns}\n);\n\n", self.table)
    }

    pub(crate) fn truncate_table(&self) -> String {
        format!("TRUNCATE TABLE {};\n\n", self.table)
    }

    /// One `INSERT` statement, terminated by `;`.
    ///
    /// # Errors
    ///
    /// `SFO001` data error when a date cannot be rendered with the mask.
    pub(crate) fn insert(&self, schema: &RowSchema, row: &Row) -> Result<String, TransformError> {
        let mut sql = String::with_capacity(64 + row.len() * 12);
        sql.push_str("INSERT INTO ");
        sql.push_str(&self.table);
        sql.push('(');
        for (i, field) in schema.fields().iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&quote_ident(self.dialect, &field.name));
        }
        sql.push_str(") VALUES (");
        for (i, field) in schema.fields().iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            let literal = self
                .literal(row.get(i).unwrap_or(&Value::Null))
                .map_err(|e| e.with_field(field.name.clone()))?;
            sql.push_str(&literal);
        }
        sql.push_str(");");
        Ok(sql)
    }

    pub(crate) fn literal(&self, value: &Value) -> Result<String, TransformError> {
        let literal = match value {
            Value::Null => "NULL".to_string(),
            Value::String(s) => quote_text(self.dialect, s),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) if n.is_finite() => n.to_string(),
            Value::Number(_) => "NULL".to_string(),
            Value::Boolean(b) => match (self.dialect, *b) {
                (Dialect::Mysql, true) => "1".to_string(),
                (Dialect::Mysql, false) => "0".to_string(),
                (_, true) => "TRUE".to_string(),
                (_, false) => "FALSE".to_string(),
            },
            Value::Date(d) => {
                // Items such as `%z` need an offset a local date does not carry.
                let mut text = String::new();
                write!(text, "{}", d.format(&self.date_format)).map_err(|_| {
                    TransformError::data(
                        "SFO001",
                        format!("date {d} cannot be rendered with format '{}'", self.date_format),
                    )
                })?;
                quote_text(self.dialect, &text)
            }
        };
        Ok(literal)
    }
}

fn quote_ident(dialect: Dialect, name: &str) -> Cow<'_, str> {
    match dialect {
        Dialect::Postgres => quote_identifier(name),
        Dialect::Ansi => Cow::Owned(format!("\"{}\"", name.replace('"', "\"\""))),
        Dialect::Mysql => Cow::Owned(format!("`{}`", name.replace('`', "``"))),
    }
}

fn quote_text(dialect: Dialect, text: &str) -> String {
    match dialect {
        Dialect::Postgres => quote_literal(text),
        Dialect::Ansi => format!("'{}'", text.replace('\'', "''")),
        Dialect::Mysql => format!("'{}'", text.replace('\\', "\\\\").replace('\'', "''")),
    }
}

fn column_type(dialect: Dialect, field: &FieldDescriptor) -> String {
    let length = field.length;
    let precision = field.precision;
    match (field.value_type, dialect) {
        (ValueType::String, _) if length > 0 => format!("VARCHAR({length})"),
        (ValueType::String, Dialect::Ansi) => "VARCHAR(255)".to_string(),
        (ValueType::String, Dialect::Postgres) => "TEXT".to_string(),
        (ValueType::String, Dialect::Mysql) => "LONGTEXT".to_string(),
        (ValueType::Integer, _) => "BIGINT".to_string(),
        (ValueType::Number, _) if length > 0 && precision >= 0 => {
            format!("DECIMAL({length}, {precision})")
        }
        (ValueType::Number, Dialect::Mysql) => "DOUBLE".to_string(),
        (ValueType::Number, _) => "DOUBLE PRECISION".to_string(),
        (ValueType::Boolean, _) => "BOOLEAN".to_string(),
        (ValueType::Date, Dialect::Mysql) => "DATETIME".to_string(),
        (ValueType::Date, _) => "TIMESTAMP".to_string(),
    }
}
