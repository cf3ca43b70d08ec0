//! Error records produced when a failed row is routed instead of stopping the run.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ErrorCategory, TransformError};
use crate::schema::RowSchema;
use crate::value::Row;

/// ISO-8601 formatted timestamp string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    #[must_use]
    pub fn new(iso8601: impl Into<String>) -> Self {
        Self(iso8601.into())
    }

    /// Current UTC time.
    #[must_use]
    pub fn now() -> Self {
        Self(chrono::Utc::now().to_rfc3339())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A row that failed processing together with its diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Step whose row operation failed.
    pub step_name: String,
    /// Copy index of the failing instance.
    pub copy: usize,
    /// The input row as it was when the failure happened.
    pub row: Row,
    /// The row rendered as a JSON object keyed by field name.
    pub record_json: String,
    pub error_code: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_field: Option<String>,
    pub error_category: ErrorCategory,
    pub failed_at: Timestamp,
}

impl ErrorRecord {
    #[must_use]
    pub fn new(
        step_name: impl Into<String>,
        copy: usize,
        schema: &RowSchema,
        row: Row,
        error: &TransformError,
    ) -> Self {
        let record_json = row.to_json_object(schema).to_string();
        Self {
            step_name: step_name.into(),
            copy,
            row,
            record_json,
            error_code: error.code.clone(),
            error_message: error.message.clone(),
            origin_field: error.field.clone(),
            error_category: error.category,
            failed_at: Timestamp::now(),
        }
    }
}
