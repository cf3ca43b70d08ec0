//! Row layout: typed field descriptors and the ordered schema built from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TransformError;

/// Length/precision sentinel meaning "not specified, infer at write time".
pub const UNSPECIFIED: i32 = -1;

/// Logical type of a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Date,
}

impl ValueType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
        }
    }

    /// Parse a persisted type name. `""` and `"none"` mean "unspecified".
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown names.
    pub fn parse_optional(raw: &str) -> Result<Option<Self>, TransformError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        trimmed.parse().map(Some)
    }
}

impl FromStr for ValueType {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" => Ok(Self::String),
            "integer" | "int" => Ok(Self::Integer),
            "number" | "bignumber" => Ok(Self::Number),
            "boolean" => Ok(Self::Boolean),
            "date" | "timestamp" => Ok(Self::Date),
            other => Err(TransformError::config(
                "UNKNOWN_TYPE",
                format!("unknown field type '{other}'"),
            )),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whitespace trimming applied when converting text into a field value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimType {
    #[default]
    None,
    Left,
    Right,
    Both,
}

impl TrimType {
    #[must_use]
    pub fn apply(self, s: &str) -> &str {
        match self {
            Self::None => s,
            Self::Left => s.trim_start(),
            Self::Right => s.trim_end(),
            Self::Both => s.trim(),
        }
    }
}

/// Description of one field in a [`RowSchema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub length: i32,
    pub precision: i32,
    /// Step that introduced the field.
    pub origin: String,
    /// Conversion mask (date or number format).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouping_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_symbol: Option<String>,
    #[serde(default)]
    pub trim: TrimType,
}

impl FieldDescriptor {
    /// Descriptor with unspecified length and precision and no formatting.
    #[must_use]
    pub fn new(name: impl Into<String>, value_type: ValueType, origin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type,
            length: UNSPECIFIED,
            precision: UNSPECIFIED,
            origin: origin.into(),
            format: None,
            decimal_symbol: None,
            grouping_symbol: None,
            currency_symbol: None,
            trim: TrimType::None,
        }
    }

    #[must_use]
    pub fn with_length(mut self, length: i32, precision: i32) -> Self {
        self.length = length;
        self.precision = precision;
        self
    }
}

/// Ordered, name-unique list of field descriptors.
///
/// Names are compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSchema {
    fields: Vec<FieldDescriptor>,
}

impl RowSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from descriptors, rejecting duplicate names.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on the first duplicate name.
    pub fn from_fields(fields: Vec<FieldDescriptor>) -> Result<Self, TransformError> {
        let mut schema = Self::new();
        for field in fields {
            schema.push(field)?;
        }
        Ok(schema)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, index: usize) -> Option<&FieldDescriptor> {
        self.fields.get(index)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Position of `name`, ignoring ASCII case.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Append a field.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the name is already present.
    pub fn push(&mut self, field: FieldDescriptor) -> Result<usize, TransformError> {
        if self.contains(&field.name) {
            return Err(TransformError::config(
                "DUPLICATE_FIELD",
                format!("field '{}' already exists in the row", field.name),
            )
            .with_field(field.name));
        }
        self.fields.push(field);
        Ok(self.fields.len() - 1)
    }

    /// Append `field`, or overwrite the existing field of the same name in
    /// place when `replace` is set. Returns the field's position.
    ///
    /// A replaced field keeps its position and name; everything else comes
    /// from `field`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the name exists and `replace` is off.
    pub fn append_or_replace(
        &mut self,
        field: FieldDescriptor,
        replace: bool,
    ) -> Result<usize, TransformError> {
        match self.index_of(&field.name) {
            Some(index) if replace => {
                let existing = &mut self.fields[index];
                let name = std::mem::take(&mut existing.name);
                *existing = FieldDescriptor { name, ..field };
                Ok(index)
            }
            _ => self.push(field),
        }
    }
}

impl<'a> IntoIterator for &'a RowSchema {
    type Item = &'a FieldDescriptor;
    type IntoIter = std::slice::Iter<'a, FieldDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(names: &[&str]) -> RowSchema {
        RowSchema::from_fields(
            names
                .iter()
                .map(|n| FieldDescriptor::new(*n, ValueType::String, "input"))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn lookup_ignores_case() {
        let s = schema(&["Id", "Name"]);
        assert_eq!(s.index_of("name"), Some(1));
        assert_eq!(s.index_of("ID"), Some(0));
        assert_eq!(s.index_of("missing"), None);
    }

    #[test]
    fn duplicate_push_is_rejected() {
        let mut s = schema(&["id"]);
        let err = s
            .push(FieldDescriptor::new("ID", ValueType::Integer, "x"))
            .unwrap_err();
        assert_eq!(err.code, "DUPLICATE_FIELD");
        assert_eq!(err.field.as_deref(), Some("ID"));
    }

    #[test]
    fn replace_keeps_position_and_name() {
        let mut s = schema(&["id", "result", "name"]);
        let idx = s
            .append_or_replace(
                FieldDescriptor::new("RESULT", ValueType::Boolean, "eval"),
                true,
            )
            .unwrap();
        assert_eq!(idx, 1);
        assert_eq!(s.len(), 3);
        let field = s.field(1).unwrap();
        assert_eq!(field.name, "result");
        assert_eq!(field.value_type, ValueType::Boolean);
        assert_eq!(field.origin, "eval");
    }

    #[test]
    fn append_without_replace_on_existing_name_fails() {
        let mut s = schema(&["result"]);
        assert!(s
            .append_or_replace(FieldDescriptor::new("result", ValueType::Boolean, "e"), false)
            .is_err());
    }

    #[test]
    fn append_new_name_goes_last() {
        let mut s = schema(&["a"]);
        let idx = s
            .append_or_replace(FieldDescriptor::new("b", ValueType::Integer, "e"), true)
            .unwrap();
        assert_eq!(idx, 1);
        assert_eq!(s.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn type_names_parse() {
        assert_eq!(ValueType::parse_optional("").unwrap(), None);
        assert_eq!(ValueType::parse_optional("None").unwrap(), None);
        assert_eq!(
            ValueType::parse_optional("Integer").unwrap(),
            Some(ValueType::Integer)
        );
        assert!(ValueType::parse_optional("blob").is_err());
    }

    #[test]
    fn trim_types() {
        assert_eq!(TrimType::Left.apply("  a "), "a ");
        assert_eq!(TrimType::Right.apply("  a "), "  a");
        assert_eq!(TrimType::Both.apply("  a "), "a");
        assert_eq!(TrimType::None.apply("  a "), "  a ");
    }
}
