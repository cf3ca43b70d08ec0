//! Resolution of configured input file lists into concrete paths.

use std::path::{Path, PathBuf};

use regex::Regex;
use rowpipe_types::error::TransformError;
use rowpipe_types::options::{FileList, FileSpec};
use rowpipe_types::variables::Variables;
use walkdir::WalkDir;

/// Outcome of [`resolve_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedFiles {
    /// Matched files, in configuration order and by name within a folder.
    pub files: Vec<PathBuf>,
    /// Names of required entries that matched nothing.
    pub missing_required: Vec<String>,
}

impl ResolvedFiles {
    /// Fail when a required entry matched nothing or nothing matched at all.
    ///
    /// # Errors
    ///
    /// Resource error `REQUIRED_FILE_MISSING` or `NO_INPUT_FILES`.
    pub fn require_some(self) -> Result<Vec<PathBuf>, TransformError> {
        if !self.missing_required.is_empty() {
            return Err(TransformError::resource(
                "REQUIRED_FILE_MISSING",
                format!(
                    "required input matched no files: {}",
                    self.missing_required.join(", ")
                ),
            ));
        }
        if self.files.is_empty() {
            return Err(TransformError::resource("NO_INPUT_FILES", "no input files found"));
        }
        Ok(self.files)
    }
}

fn full_match(pattern: &str, what: &str) -> Result<Regex, TransformError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
        TransformError::config("INVALID_MASK", format!("invalid {what} '{pattern}': {e}"))
    })
}

/// Resolve every entry with variables applied.
///
/// A name that is a file is taken as-is. A folder is listed (recursively when
/// `include_subfolders`) and its files are filtered by `mask` and
/// `exclude_mask`, both full-match regular expressions over the file name.
///
/// # Errors
///
/// Configuration error for a mask that is not a valid regular expression.
pub fn resolve_files(list: &FileList, variables: &dyn Variables) -> Result<ResolvedFiles, TransformError> {
    let mut resolved = ResolvedFiles::default();
    for spec in list.iter() {
        let matched = resolve_entry(spec, variables)?;
        if matched.is_empty() {
            tracing::debug!(entry = spec.name, "File entry matched nothing");
            if spec.required {
                resolved.missing_required.push(variables.resolve(&spec.name));
            }
        }
        for path in matched {
            if !resolved.files.contains(&path) {
                resolved.files.push(path);
            }
        }
    }
    Ok(resolved)
}

fn resolve_entry(spec: &FileSpec, variables: &dyn Variables) -> Result<Vec<PathBuf>, TransformError> {
    let name = variables.resolve(&spec.name);
    let include = spec
        .mask
        .as_deref()
        .map(|m| variables.resolve(m))
        .filter(|m| !m.is_empty())
        .map(|m| full_match(&m, "mask"))
        .transpose()?;
    let exclude = spec
        .exclude_mask
        .as_deref()
        .map(|m| variables.resolve(m))
        .filter(|m| !m.is_empty())
        .map(|m| full_match(&m, "exclude mask"))
        .transpose()?;

    let root = Path::new(&name);
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let max_depth = if spec.include_subfolders { usize::MAX } else { 1 };
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let file_name = entry.file_name().to_string_lossy();
            include.as_ref().map_or(true, |re| re.is_match(&file_name))
                && !exclude.as_ref().is_some_and(|re| re.is_match(&file_name))
        })
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.dedup();
    Ok(files)
}
