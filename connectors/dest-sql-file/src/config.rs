use rowpipe_types::error::TransformError;
use rowpipe_types::variables::Variables;
use serde::{Deserialize, Serialize};

use rowpipe_engine::resource::{FileNaming, OutputEncoding};

fn default_extension() -> String {
    "sql".to_string()
}

fn default_true() -> bool {
    true
}

/// SQL flavour used for identifier quoting, literals and column types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Ansi,
    Postgres,
    Mysql,
}

/// Output file settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Base path without extension; variables are resolved.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub include_copy_nr: bool,
    #[serde(default)]
    pub append: bool,
    /// Rows per file; 0 writes a single file.
    #[serde(default)]
    pub split_every: u64,
    #[serde(default)]
    pub create_parent_folder: bool,
    /// Open the first file on the first row instead of during `init`.
    #[serde(default)]
    pub lazy_open: bool,
    #[serde(default)]
    pub encoding: String,
    #[serde(default = "default_true")]
    pub add_to_result: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            extension: default_extension(),
            include_copy_nr: false,
            append: false,
            split_every: 0,
            create_parent_folder: false,
            lazy_open: false,
            encoding: String::new(),
            add_to_result: true,
        }
    }
}

/// `sql-file-output` step configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub table_name: String,
    /// Write a CREATE TABLE statement before the first row.
    #[serde(default)]
    pub create_table: bool,
    /// Write a TRUNCATE TABLE statement before the first row.
    #[serde(default)]
    pub truncate_table: bool,
    #[serde(default = "default_true")]
    pub start_new_line: bool,
    /// Mask for date literals, e.g. `yyyy-MM-dd HH:mm:ss`.
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default)]
    pub file: FileConfig,
}

impl Config {
    /// Resolved output naming for this run.
    pub fn naming(&self, variables: &dyn Variables) -> FileNaming {
        FileNaming {
            base: variables.resolve(&self.file.name),
            extension: Some(variables.resolve(&self.file.extension)),
            include_copy_nr: self.file.include_copy_nr,
            split_every: self.file.split_every,
        }
    }

    /// # Errors
    ///
    /// `UNSUPPORTED_ENCODING` for an unknown label.
    pub fn encoding(&self, variables: &dyn Variables) -> Result<OutputEncoding, TransformError> {
        OutputEncoding::from_label(&variables.resolve(&self.file.encoding))
    }

    pub fn problems(&self, variables: &dyn Variables) -> Vec<String> {
        let mut problems = Vec::new();
        if variables.resolve(&self.table_name).trim().is_empty() {
            problems.push("table name is required".to_string());
        }
        if variables.resolve(&self.file.name).trim().is_empty() {
            problems.push("output file name is required".to_string());
        }
        if let Err(e) = self.encoding(variables) {
            problems.push(e.message);
        }
        problems
    }
}
