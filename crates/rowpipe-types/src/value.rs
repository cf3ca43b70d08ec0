//! Field values and rows.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::ops::Index;

use crate::schema::RowSchema;

/// Default textual form of dates.
pub const DEFAULT_DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.3f";

/// A single field value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    #[default]
    Null,
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    Date(NaiveDateTime),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Textual form of the value, `None` for null.
    ///
    /// Booleans render as `Y`/`N` and dates with [`DEFAULT_DATE_FORMAT`].
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::String(s) => Some(s.clone()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Number(n) => Some(n.to_string()),
            Self::Boolean(b) => Some(if *b { "Y" } else { "N" }.to_string()),
            Self::Date(d) => Some(d.format(DEFAULT_DATE_FORMAT).to_string()),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Date(d) => {
                serde_json::Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Values positionally aligned with a [`RowSchema`].
///
/// Rows are moved, never shared: once pushed downstream the producer no
/// longer holds them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Vec<Value>);

impl Row {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub fn push(&mut self, value: Value) {
        self.0.push(value);
    }

    /// Set `index`, padding with nulls if the row is shorter.
    pub fn set(&mut self, index: usize, value: Value) {
        if index >= self.0.len() {
            self.0.resize(index + 1, Value::Null);
        }
        self.0[index] = value;
    }

    /// Pad with nulls up to `len` fields.
    pub fn resize(&mut self, len: usize) {
        self.0.resize(len, Value::Null);
    }

    /// Render as a JSON object keyed by field name.
    ///
    /// Values beyond the schema are keyed by position.
    #[must_use]
    pub fn to_json_object(&self, schema: &RowSchema) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(self.0.len());
        for (idx, value) in self.0.iter().enumerate() {
            let key = schema
                .field(idx)
                .map_or_else(|| format!("_{idx}"), |f| f.name.clone());
            map.insert(key, value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}
