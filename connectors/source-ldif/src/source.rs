//! Row production for `ldif-input`.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime};
use rowpipe_engine::convert::convert_text;
use rowpipe_engine::files::resolve_files;
use rowpipe_engine::transform::{RowOutcome, Source, StepContext};
use rowpipe_types::error::{TransformError, ValidationResult};
use rowpipe_types::schema::{FieldDescriptor, RowSchema, ValueType};
use rowpipe_types::value::{Row, Value};
use rowpipe_types::variables::Variables;

use crate::config::Config;
use crate::parser::{LdifReader, LdifRecord};

/// Optional fields appended after the configured ones, in schema order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extra {
    Filename,
    RowNum,
    ContentType,
    Dn,
    ShortFilename,
    Extension,
    Path,
    Size,
    Hidden,
    LastModified,
    Uri,
    RootUri,
}

impl Extra {
    fn descriptor(self, name: String, origin: &str) -> FieldDescriptor {
        match self {
            Self::Filename => FieldDescriptor::new(name, ValueType::String, origin).with_length(100, -1),
            Self::RowNum | Self::Size => FieldDescriptor::new(name, ValueType::Integer, origin),
            Self::Hidden => FieldDescriptor::new(name, ValueType::Boolean, origin),
            Self::LastModified => FieldDescriptor::new(name, ValueType::Date, origin),
            Self::ContentType
            | Self::Dn
            | Self::ShortFilename
            | Self::Extension
            | Self::Path
            | Self::Uri
            | Self::RootUri => FieldDescriptor::new(name, ValueType::String, origin),
        }
    }
}

/// Enabled optional fields with their resolved names.
fn extras(config: &Config, variables: &dyn Variables) -> Vec<(Extra, String)> {
    let mut out = Vec::new();
    let toggles = [
        (config.include_filename, Extra::Filename, &config.filename_field),
        (config.include_rownum, Extra::RowNum, &config.rownum_field),
        (config.include_content_type, Extra::ContentType, &config.content_type_field),
        (config.include_dn, Extra::Dn, &config.dn_field),
    ];
    for (enabled, extra, name) in toggles {
        if enabled {
            out.push((extra, variables.resolve(name)));
        }
    }
    let named = [
        (Extra::ShortFilename, &config.short_filename_field),
        (Extra::Extension, &config.extension_field),
        (Extra::Path, &config.path_field),
        (Extra::Size, &config.size_field),
        (Extra::Hidden, &config.hidden_field),
        (Extra::LastModified, &config.last_modified_field),
        (Extra::Uri, &config.uri_field),
        (Extra::RootUri, &config.root_uri_field),
    ];
    for (extra, name) in named {
        if let Some(name) = name.as_deref().filter(|n| !n.trim().is_empty()) {
            out.push((extra, variables.resolve(name)));
        }
    }
    out
}

/// Values shared by every row read from one file.
#[derive(Debug, Clone)]
struct FileInfo {
    filename: String,
    short_filename: String,
    extension: String,
    path: String,
    size: i64,
    hidden: bool,
    last_modified: Option<NaiveDateTime>,
    uri: String,
    root_uri: String,
}

impl FileInfo {
    fn read(path: &Path) -> Result<Self, TransformError> {
        let metadata = fs::metadata(path).map_err(|e| {
            TransformError::resource("READ_FAILED", format!("cannot stat {}: {e}", path.display()))
        })?;
        let absolute = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let short_filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let root = absolute
            .ancestors()
            .last()
            .map(|r| r.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            filename: path.display().to_string(),
            hidden: short_filename.starts_with('.'),
            extension: path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            size: i64::try_from(metadata.len()).unwrap_or(i64::MAX),
            last_modified: metadata
                .modified()
                .ok()
                .map(|t| DateTime::<Local>::from(t).naive_local()),
            uri: file_uri(&absolute.to_string_lossy()),
            root_uri: file_uri(&root),
            short_filename,
        })
    }

    fn value(&self, extra: Extra, record: &LdifRecord, rownum: u64) -> Value {
        match extra {
            Extra::Filename => Value::from(self.filename.as_str()),
            Extra::RowNum => Value::Integer(i64::try_from(rownum).unwrap_or(i64::MAX)),
            Extra::ContentType => Value::from(record.content_type()),
            Extra::Dn => Value::from(record.dn.as_str()),
            Extra::ShortFilename => Value::from(self.short_filename.as_str()),
            Extra::Extension => Value::from(self.extension.as_str()),
            Extra::Path => Value::from(self.path.as_str()),
            Extra::Size => Value::Integer(self.size),
            Extra::Hidden => Value::Boolean(self.hidden),
            Extra::LastModified => self.last_modified.map_or(Value::Null, Value::Date),
            Extra::Uri => Value::from(self.uri.as_str()),
            Extra::RootUri => Value::from(self.root_uri.as_str()),
        }
    }
}

fn file_uri(path: &str) -> String {
    let path = path.replace('\\', "/");
    if path.starts_with('/') {
        format!("file://{path}")
    } else {
        format!("file:///{path}")
    }
}

struct OpenFile {
    info: FileInfo,
    reader: LdifReader<BufReader<File>>,
}

impl OpenFile {
    fn open(path: &Path) -> Result<Self, TransformError> {
        let info = FileInfo::read(path)?;
        let file = File::open(path).map_err(|e| {
            TransformError::resource("READ_FAILED", format!("cannot open {}: {e}", path.display()))
        })?;
        Ok(Self {
            reader: LdifReader::new(BufReader::new(file), path.display().to_string()),
            info,
        })
    }
}

pub struct LdifInput {
    config: Config,
    files: Vec<PathBuf>,
    next_file: usize,
    current: Option<OpenFile>,
    extras: Vec<Extra>,
    rows: u64,
}

impl LdifInput {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            files: Vec::new(),
            next_file: 0,
            current: None,
            extras: Vec::new(),
            rows: 0,
        }
    }

    /// Open the next file in the list; `false` once the list is exhausted.
    fn open_next(&mut self, ctx: &StepContext) -> Result<bool, TransformError> {
        let Some(path) = self.files.get(self.next_file) else {
            return Ok(false);
        };
        self.next_file += 1;
        let open = OpenFile::open(path)?;
        tracing::debug!(step = ctx.step_name(), path = %path.display(), "Reading LDIF file");
        if self.config.add_to_result {
            ctx.add_result_file(path.clone(), "read by ldif-input");
        }
        self.current = Some(open);
        Ok(true)
    }

    fn build_row(&self, record: &LdifRecord, output: &RowSchema) -> RowOutcome {
        let mut row = Row::with_capacity(output.len());
        let mut failure = None;
        for (i, spec) in self.config.fields.iter().enumerate() {
            let Some(desc) = output.field(i) else {
                break;
            };
            let joined = record
                .values(spec.source_attribute())
                .map(|values| values.join(&self.config.multi_valued_separator));
            match convert_text(desc, joined.as_deref(), spec.null_if.as_deref(), spec.if_null.as_deref()) {
                Ok(value) => row.push(value),
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(
                            TransformError::data(
                                "LDIF001",
                                format!("entry '{}': {}", record.dn, e.message),
                            )
                            .with_field(desc.name.clone()),
                        );
                    }
                    row.push(Value::Null);
                }
            }
        }

        let info = self.current.as_ref().map(|open| &open.info);
        for extra in &self.extras {
            row.push(info.map_or(Value::Null, |info| info.value(*extra, record, self.rows)));
        }
        row.resize(output.len());

        match failure {
            Some(error) => RowOutcome::failed(row, error),
            None => RowOutcome::one(row),
        }
    }
}

impl Source for LdifInput {
    fn validate(&self, _variables: &dyn Variables) -> ValidationResult {
        ValidationResult::from_problems(&self.config.problems(), "LDIF input configuration is valid")
    }

    fn init(&mut self, ctx: &StepContext) -> Result<(), TransformError> {
        if let Some(problem) = self.config.problems().into_iter().next() {
            return Err(TransformError::config("INVALID_CONFIG", problem));
        }
        self.files = resolve_files(&self.config.files, ctx.variables())?.require_some()?;
        self.extras = extras(&self.config, ctx.variables())
            .into_iter()
            .map(|(extra, _)| extra)
            .collect();
        tracing::info!(
            step = ctx.step_name(),
            files = self.files.len(),
            row_limit = self.config.row_limit,
            "LDIF input ready"
        );
        Ok(())
    }

    fn derive_output_schema(&self, ctx: &StepContext) -> Result<RowSchema, TransformError> {
        let origin = ctx.step_name();
        let mut schema = RowSchema::new();
        for spec in self.config.fields.iter() {
            schema.push(spec.to_descriptor(ctx.resolve(&spec.name), origin))?;
        }
        for (extra, name) in extras(&self.config, ctx.variables()) {
            schema.push(extra.descriptor(name, origin))?;
        }
        Ok(schema)
    }

    fn next_row(
        &mut self,
        output: &RowSchema,
        ctx: &StepContext,
    ) -> Result<Option<RowOutcome>, TransformError> {
        loop {
            if self.config.row_limit > 0 && self.rows >= self.config.row_limit {
                return Ok(None);
            }
            let Some(open) = self.current.as_mut() else {
                if !self.open_next(ctx)? {
                    return Ok(None);
                }
                continue;
            };
            let Some(record) = open.reader.next_record()? else {
                self.current = None;
                continue;
            };
            self.rows += 1;
            ctx.counters().increment_lines_input();
            tracing::trace!(step = ctx.step_name(), dn = %record.dn, "Read LDIF entry");
            return Ok(Some(self.build_row(&record, output)));
        }
    }

    fn dispose(&mut self, ctx: &StepContext) -> Result<(), TransformError> {
        self.current = None;
        tracing::debug!(step = ctx.step_name(), rows = self.rows, "LDIF input closed");
        Ok(())
    }
}
