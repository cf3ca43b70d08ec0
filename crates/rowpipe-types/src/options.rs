//! Configuration value objects shared by transforms: field and file lists.
//!
//! Both lists are stored as ordered records. On load they also accept the
//! columnar form, where every attribute is its own list indexed by position:
//!
//! ```yaml
//! fields:
//!   name: [uid, mail]
//!   type: [string, string]
//!   length: [20, -1]
//! ```
//!
//! The columnar form is converted all-or-none. A column whose length differs
//! from `name` fails the whole list with a configuration error. An absent or
//! empty column means "default for every entry".

use serde::{Deserialize, Deserializer, Serialize};
use std::ops::Deref;

use crate::error::TransformError;
use crate::schema::{FieldDescriptor, TrimType, ValueType, UNSPECIFIED};

fn unspecified() -> i32 {
    UNSPECIFIED
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_unspecified(v: &i32) -> bool {
    *v == UNSPECIFIED
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(v: &bool) -> bool {
    !*v
}

fn is_no_trim(t: &TrimType) -> bool {
    *t == TrimType::None
}

fn deserialize_optional_type<'de, D>(deserializer: D) -> Result<Option<ValueType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => ValueType::parse_optional(&s).map_err(serde::de::Error::custom),
    }
}

/// Boolean as persisted by older configurations: `true`/`false` or `Y`/`N`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Text(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "y" | "yes" | "true" | "1"
            ),
        }
    }
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Flag::deserialize(deserializer).map(|f| f.as_bool())
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn check_column(list: &str, column: &str, len: usize, expected: usize) -> Result<(), TransformError> {
    if len == 0 || len == expected {
        Ok(())
    } else {
        Err(TransformError::config(
            "MISMATCHED_COLUMNS",
            format!("{list}: column '{column}' has {len} entries, expected {expected}"),
        ))
    }
}

fn take<T: Default>(column: &mut [T], idx: usize) -> T {
    column.get_mut(idx).map(std::mem::take).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Configured output field.
///
/// `value_type` stays `None` until schema derivation, where an unspecified
/// type becomes [`ValueType::String`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(
        rename = "type",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_type"
    )]
    pub value_type: Option<ValueType>,
    #[serde(default = "unspecified", skip_serializing_if = "is_unspecified")]
    pub length: i32,
    #[serde(default = "unspecified", skip_serializing_if = "is_unspecified")]
    pub precision: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Text that converts to null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub null_if: Option<String>,
    /// Text substituted for a null or empty value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_null: Option<String>,
    #[serde(default, skip_serializing_if = "is_no_trim")]
    pub trim: TrimType,
    /// External attribute the field is read from, when it differs from `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl FieldSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: None,
            length: UNSPECIFIED,
            precision: UNSPECIFIED,
            format: None,
            group: None,
            decimal: None,
            currency: None,
            null_if: None,
            if_null: None,
            trim: TrimType::None,
            attribute: None,
        }
    }

    #[must_use]
    pub fn with_type(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    /// Declared type, or string when none was given.
    #[must_use]
    pub fn resolved_type(&self) -> ValueType {
        self.value_type.unwrap_or_default()
    }

    /// Build the schema descriptor for this field under `name`.
    ///
    /// `name` is passed separately so callers can resolve variables first.
    #[must_use]
    pub fn to_descriptor(&self, name: impl Into<String>, origin: &str) -> FieldDescriptor {
        FieldDescriptor {
            name: name.into(),
            value_type: self.resolved_type(),
            length: self.length,
            precision: self.precision,
            origin: origin.to_string(),
            format: self.format.clone(),
            decimal_symbol: self.decimal.clone(),
            grouping_symbol: self.group.clone(),
            currency_symbol: self.currency.clone(),
            trim: self.trim,
        }
    }

    /// Attribute to read, defaulting to the field name.
    #[must_use]
    pub fn source_attribute(&self) -> &str {
        self.attribute.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Deserialize)]
struct FieldColumns {
    name: Vec<String>,
    #[serde(default, rename = "type")]
    value_type: Vec<String>,
    #[serde(default)]
    length: Vec<i32>,
    #[serde(default)]
    precision: Vec<i32>,
    #[serde(default)]
    format: Vec<String>,
    #[serde(default)]
    group: Vec<String>,
    #[serde(default)]
    decimal: Vec<String>,
    #[serde(default)]
    currency: Vec<String>,
    #[serde(default)]
    null_if: Vec<String>,
    #[serde(default)]
    if_null: Vec<String>,
    #[serde(default)]
    trim: Vec<TrimType>,
    #[serde(default)]
    attribute: Vec<String>,
}

impl FieldColumns {
    fn into_records(mut self) -> Result<Vec<FieldSpec>, TransformError> {
        let n = self.name.len();
        for (column, len) in [
            ("type", self.value_type.len()),
            ("length", self.length.len()),
            ("precision", self.precision.len()),
            ("format", self.format.len()),
            ("group", self.group.len()),
            ("decimal", self.decimal.len()),
            ("currency", self.currency.len()),
            ("null_if", self.null_if.len()),
            ("if_null", self.if_null.len()),
            ("trim", self.trim.len()),
            ("attribute", self.attribute.len()),
        ] {
            check_column("fields", column, len, n)?;
        }

        let mut records = Vec::with_capacity(n);
        for (i, name) in std::mem::take(&mut self.name).into_iter().enumerate() {
            records.push(FieldSpec {
                name,
                value_type: ValueType::parse_optional(&take(&mut self.value_type, i))?,
                length: self.length.get(i).copied().unwrap_or(UNSPECIFIED),
                precision: self.precision.get(i).copied().unwrap_or(UNSPECIFIED),
                format: non_empty(take(&mut self.format, i)),
                group: non_empty(take(&mut self.group, i)),
                decimal: non_empty(take(&mut self.decimal, i)),
                currency: non_empty(take(&mut self.currency, i)),
                null_if: non_empty(take(&mut self.null_if, i)),
                if_null: non_empty(take(&mut self.if_null, i)),
                trim: self.trim.get(i).copied().unwrap_or_default(),
                attribute: non_empty(take(&mut self.attribute, i)),
            });
        }
        Ok(records)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FieldListRepr {
    Records(Vec<FieldSpec>),
    Columns(FieldColumns),
}

/// Ordered list of [`FieldSpec`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FieldListRepr")]
pub struct FieldList(Vec<FieldSpec>);

impl FieldList {
    #[must_use]
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self(fields)
    }
}

impl TryFrom<FieldListRepr> for FieldList {
    type Error = TransformError;

    fn try_from(repr: FieldListRepr) -> Result<Self, Self::Error> {
        match repr {
            FieldListRepr::Records(records) => Ok(Self(records)),
            FieldListRepr::Columns(columns) => columns.into_records().map(Self),
        }
    }
}

impl Deref for FieldList {
    type Target = [FieldSpec];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<FieldSpec>> for FieldList {
    fn from(fields: Vec<FieldSpec>) -> Self {
        Self(fields)
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// One entry of an input file list.
///
/// `name` is a file or a directory. For a directory, `mask` and
/// `exclude_mask` are regular expressions matched against file names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_mask: Option<String>,
    /// Fail the run when this entry matches nothing.
    #[serde(default, skip_serializing_if = "is_false", deserialize_with = "deserialize_flag")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "is_false", deserialize_with = "deserialize_flag")]
    pub include_subfolders: bool,
}

impl FileSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mask: None,
            exclude_mask: None,
            required: false,
            include_subfolders: false,
        }
    }
}

#[derive(Deserialize)]
struct FileColumns {
    name: Vec<String>,
    #[serde(default)]
    mask: Vec<String>,
    #[serde(default)]
    exclude_mask: Vec<String>,
    #[serde(default)]
    required: Vec<Flag>,
    #[serde(default)]
    include_subfolders: Vec<Flag>,
}

impl FileColumns {
    fn into_records(mut self) -> Result<Vec<FileSpec>, TransformError> {
        let n = self.name.len();
        for (column, len) in [
            ("mask", self.mask.len()),
            ("exclude_mask", self.exclude_mask.len()),
            ("required", self.required.len()),
            ("include_subfolders", self.include_subfolders.len()),
        ] {
            check_column("files", column, len, n)?;
        }

        let records = std::mem::take(&mut self.name)
            .into_iter()
            .enumerate()
            .map(|(i, name)| FileSpec {
                name,
                mask: non_empty(take(&mut self.mask, i)),
                exclude_mask: non_empty(take(&mut self.exclude_mask, i)),
                required: self.required.get(i).is_some_and(Flag::as_bool),
                include_subfolders: self.include_subfolders.get(i).is_some_and(Flag::as_bool),
            })
            .collect();
        Ok(records)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FileListRepr {
    Records(Vec<FileSpec>),
    Columns(FileColumns),
}

/// Ordered list of [`FileSpec`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FileListRepr")]
pub struct FileList(Vec<FileSpec>);

impl FileList {
    #[must_use]
    pub fn new(files: Vec<FileSpec>) -> Self {
        Self(files)
    }
}

impl TryFrom<FileListRepr> for FileList {
    type Error = TransformError;

    fn try_from(repr: FileListRepr) -> Result<Self, Self::Error> {
        match repr {
            FileListRepr::Records(records) => Ok(Self(records)),
            FileListRepr::Columns(columns) => columns.into_records().map(Self),
        }
    }
}

impl Deref for FileList {
    type Target = [FileSpec];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<FileSpec>> for FileList {
    fn from(files: Vec<FileSpec>) -> Self {
        Self(files)
    }
}
