use rowpipe_types::options::{FieldList, FileList};
use serde::{Deserialize, Serialize};

fn default_filename_field() -> String {
    "filename".to_string()
}

fn default_rownum_field() -> String {
    "rownum".to_string()
}

fn default_content_type_field() -> String {
    "contenttype".to_string()
}

fn default_dn_field() -> String {
    "dn".to_string()
}

fn default_separator() -> String {
    ",".to_string()
}

/// `ldif-input` step configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub files: FileList,
    /// Output fields; `attribute` names the LDIF attribute when it differs.
    #[serde(default)]
    pub fields: FieldList,
    #[serde(default)]
    pub include_filename: bool,
    #[serde(default = "default_filename_field")]
    pub filename_field: String,
    #[serde(default)]
    pub include_rownum: bool,
    #[serde(default = "default_rownum_field")]
    pub rownum_field: String,
    #[serde(default)]
    pub include_content_type: bool,
    #[serde(default = "default_content_type_field")]
    pub content_type_field: String,
    #[serde(default)]
    pub include_dn: bool,
    #[serde(default = "default_dn_field")]
    pub dn_field: String,
    /// Stop after this many rows; 0 reads everything.
    #[serde(default)]
    pub row_limit: u64,
    #[serde(default = "default_separator")]
    pub multi_valued_separator: String,
    #[serde(default)]
    pub short_filename_field: Option<String>,
    #[serde(default)]
    pub extension_field: Option<String>,
    #[serde(default)]
    pub path_field: Option<String>,
    #[serde(default)]
    pub size_field: Option<String>,
    #[serde(default)]
    pub hidden_field: Option<String>,
    #[serde(default)]
    pub last_modified_field: Option<String>,
    #[serde(default)]
    pub uri_field: Option<String>,
    #[serde(default)]
    pub root_uri_field: Option<String>,
    /// Register every read file as a result file.
    #[serde(default)]
    pub add_to_result: bool,
}

impl Config {
    /// Configuration problems found without touching the file system.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.files.is_empty() {
            problems.push("no input files configured".to_string());
        }
        if self.fields.iter().any(|f| f.name.trim().is_empty()) {
            problems.push("every field needs a name".to_string());
        }
        let toggles = [
            (self.include_filename, &self.filename_field, "filename"),
            (self.include_rownum, &self.rownum_field, "row number"),
            (self.include_content_type, &self.content_type_field, "content type"),
            (self.include_dn, &self.dn_field, "dn"),
        ];
        for (enabled, field, what) in toggles {
            if enabled && field.trim().is_empty() {
                problems.push(format!("{what} field is enabled but has no name"));
            }
        }
        problems
    }
}
