//! External output resources: targets, handles and split rotation.
//!
//! A transform never opens files itself. It asks the [`OutputTarget`] from
//! its context, so the same transform writes to the filesystem in a normal
//! run and to memory in a dry run or a test.
//!
//! [`SplitWriter`] owns at most one open [`ResourceHandle`] at a time. When
//! `split_every > 0`, the handle is closed and the next split opened once
//! `lines_output` reaches a multiple of `split_every`, so `M` rows produce
//! `ceil(M / split_every)` handles.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rowpipe_types::error::TransformError;
use serde::Serialize;

use crate::counters::TransformCounters;

/// Where output resources are opened.
pub trait OutputTarget: Send + Sync {
    /// Open `path` for writing, truncating unless `append` is set.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error (missing parent, permission denied).
    fn open(&self, path: &Path, append: bool) -> io::Result<Box<dyn Write + Send>>;

    fn exists(&self, path: &Path) -> bool;

    /// Create `dir` and any missing ancestors. Succeeds when it already exists.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
}

/// Local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileTarget;

impl OutputTarget for LocalFileTarget {
    fn open(&self, path: &Path, append: bool) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    opens: usize,
    closes: usize,
    closes_by_path: BTreeMap<PathBuf, usize>,
}

/// In-memory target used for dry runs.
///
/// Directories are implicit: opening never fails for a missing parent.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    state: Arc<Mutex<MemoryState>>,
    fail_flush: bool,
}

impl MemoryTarget {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Target whose writers fail on flush, which makes every close fail.
    #[must_use]
    pub fn failing_flush() -> Self {
        Self {
            fail_flush: true,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Contents of `path` decoded as UTF-8 (lossy).
    #[must_use]
    pub fn contents(&self, path: &Path) -> Option<String> {
        self.state()
            .files
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    #[must_use]
    pub fn bytes(&self, path: &Path) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    /// Every written path with its size in bytes.
    #[must_use]
    pub fn files(&self) -> Vec<(PathBuf, u64)> {
        self.state()
            .files
            .iter()
            .map(|(path, bytes)| (path.clone(), bytes.len() as u64))
            .collect()
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    /// How often each path's writer was closed.
    #[must_use]
    pub fn closes_by_path(&self) -> Vec<(PathBuf, usize)> {
        self.state()
            .closes_by_path
            .iter()
            .map(|(path, n)| (path.clone(), *n))
            .collect()
    }

    #[must_use]
    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.state().dirs.iter().cloned().collect()
    }
}

impl OutputTarget for MemoryTarget {
    fn open(&self, path: &Path, append: bool) -> io::Result<Box<dyn Write + Send>> {
        let mut state = self.state();
        state.opens += 1;
        let entry = state.files.entry(path.to_path_buf()).or_default();
        if !append {
            entry.clear();
        }
        Ok(Box::new(MemoryWriter {
            path: path.to_path_buf(),
            state: Arc::clone(&self.state),
            fail_flush: self.fail_flush,
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.state();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        self.state().dirs.insert(dir.to_path_buf());
        Ok(())
    }
}

struct MemoryWriter {
    path: PathBuf,
    state: Arc<Mutex<MemoryState>>,
    fail_flush: bool,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .files
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.fail_flush {
            return Err(io::Error::other("flush rejected by target"));
        }
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closes += 1;
        *state.closes_by_path.entry(self.path.clone()).or_default() += 1;
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Character encoding applied to text before it reaches the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputEncoding {
    #[default]
    Utf8,
    Latin1,
    Ascii,
}

impl OutputEncoding {
    /// Parse an encoding label. An empty label means UTF-8.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unsupported encodings.
    pub fn from_label(label: &str) -> Result<Self, TransformError> {
        match label.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "" | "utf-8" | "utf8" => Ok(Self::Utf8),
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => Ok(Self::Latin1),
            "us-ascii" | "ascii" => Ok(Self::Ascii),
            other => Err(TransformError::config(
                "UNSUPPORTED_ENCODING",
                format!("unsupported output encoding '{other}'"),
            )),
        }
    }

    fn max_code_point(self) -> u32 {
        match self {
            Self::Utf8 => u32::MAX,
            Self::Latin1 => 0xFF,
            Self::Ascii => 0x7F,
        }
    }

    /// Encode `text`.
    ///
    /// # Errors
    ///
    /// Returns a data error when `text` holds a character the encoding
    /// cannot represent.
    pub fn encode<'a>(&self, text: &'a str) -> Result<Cow<'a, [u8]>, TransformError> {
        if *self == Self::Utf8 || text.is_ascii() {
            return Ok(Cow::Borrowed(text.as_bytes()));
        }
        let max = self.max_code_point();
        let mut out = Vec::with_capacity(text.len());
        for c in text.chars() {
            let code = u32::from(c);
            if code > max {
                return Err(TransformError::data(
                    "UNMAPPABLE_CHARACTER",
                    format!("character {c:?} cannot be encoded as {self:?}"),
                ));
            }
            #[allow(clippy::cast_possible_truncation)]
            out.push(code as u8);
        }
        Ok(Cow::Owned(out))
    }
}

// ---------------------------------------------------------------------------
// Naming and result files
// ---------------------------------------------------------------------------

/// Deterministic output file names: `{base}[_{copy}][_{split}][.{ext}]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNaming {
    pub base: String,
    pub extension: Option<String>,
    pub include_copy_nr: bool,
    /// Rows per split; 0 disables splitting and the split suffix.
    pub split_every: u64,
}

impl FileNaming {
    #[must_use]
    pub fn path_for(&self, copy: usize, split: u64) -> PathBuf {
        let mut name = self.base.clone();
        if self.include_copy_nr {
            name.push('_');
            name.push_str(&copy.to_string());
        }
        if self.split_every > 0 {
            name.push('_');
            name.push_str(&split.to_string());
        }
        if let Some(ext) = self.extension.as_deref().filter(|e| !e.is_empty()) {
            name.push('.');
            name.push_str(ext);
        }
        PathBuf::from(name)
    }
}

/// File produced by a step, reported in the run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultFile {
    pub path: PathBuf,
    pub step_name: String,
    pub comment: String,
}

/// Shared list of produced files for one run.
#[derive(Debug, Clone, Default)]
pub struct ResultFiles(Arc<Mutex<Vec<ResultFile>>>);

impl ResultFiles {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, file: ResultFile) {
        let mut files = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !files.iter().any(|f| f.path == file.path) {
            files.push(file);
        }
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<ResultFile> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Handles and rotation
// ---------------------------------------------------------------------------

/// One open output resource.
pub struct ResourceHandle {
    split: u64,
    path: PathBuf,
    rows: u64,
    bytes: u64,
    writer: BufWriter<Box<dyn Write + Send>>,
}

impl ResourceHandle {
    #[must_use]
    pub fn split(&self) -> u64 {
        self.split
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("split", &self.split)
            .field("path", &self.path)
            .field("rows", &self.rows)
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

/// Writer over a sequence of split files for one transform copy.
pub struct SplitWriter {
    target: Arc<dyn OutputTarget>,
    naming: FileNaming,
    copy: usize,
    append: bool,
    encoding: OutputEncoding,
    current: Option<ResourceHandle>,
    next_split: u64,
    opened: Vec<PathBuf>,
    preamble_written: bool,
}

impl SplitWriter {
    #[must_use]
    pub fn new(target: Arc<dyn OutputTarget>, naming: FileNaming, copy: usize) -> Self {
        Self {
            target,
            naming,
            copy,
            append: false,
            encoding: OutputEncoding::Utf8,
            current: None,
            next_split: 0,
            opened: Vec::new(),
            preamble_written: false,
        }
    }

    #[must_use]
    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: OutputEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Path the next split will be opened at.
    #[must_use]
    pub fn next_path(&self) -> PathBuf {
        self.naming.path_for(self.copy, self.next_split)
    }

    /// Create the parent directory of the output files. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a resource error when the directory cannot be created.
    pub fn create_parent_dir(&self) -> Result<Option<PathBuf>, TransformError> {
        let path = self.next_path();
        let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(None);
        };
        if self.target.exists(parent) {
            return Ok(None);
        }
        self.target.create_dir_all(parent).map_err(|e| {
            TransformError::resource(
                "CREATE_FOLDER_FAILED",
                format!("cannot create folder {}: {e}", parent.display()),
            )
        })?;
        tracing::debug!(folder = %parent.display(), "Created parent folder");
        Ok(Some(parent.to_path_buf()))
    }

    #[must_use]
    pub fn current(&self) -> Option<&ResourceHandle> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Every path opened so far, in order.
    #[must_use]
    pub fn opened_paths(&self) -> &[PathBuf] {
        &self.opened
    }

    /// Open the next split. The current handle must already be closed.
    ///
    /// # Errors
    ///
    /// Returns a resource error when the target refuses the open.
    pub fn open_next(&mut self) -> Result<PathBuf, TransformError> {
        if self.current.is_some() {
            return Err(TransformError::internal(
                "HANDLE_ALREADY_OPEN",
                "a resource handle is already open for this instance",
            ));
        }
        let path = self.next_path();
        let writer = self.target.open(&path, self.append).map_err(|e| {
            TransformError::resource(
                "OPEN_FAILED",
                format!("cannot open {}: {e}", path.display()),
            )
        })?;
        tracing::debug!(path = %path.display(), split = self.next_split, "Opened output file");
        self.current = Some(ResourceHandle {
            split: self.next_split,
            path: path.clone(),
            rows: 0,
            bytes: 0,
            writer: BufWriter::new(writer),
        });
        self.next_split += 1;
        self.opened.push(path.clone());
        Ok(path)
    }

    /// Open the first split if nothing is open. Returns the path when a
    /// handle was opened.
    ///
    /// # Errors
    ///
    /// Returns a resource error when the target refuses the open.
    pub fn ensure_open(&mut self) -> Result<Option<PathBuf>, TransformError> {
        if self.current.is_some() {
            return Ok(None);
        }
        self.open_next().map(Some)
    }

    /// Close the current handle and open the next split when the output
    /// count has reached a split boundary. Returns the new path on rotation.
    ///
    /// A handle that has not received a row since it was opened is never
    /// rotated, so a failed write cannot produce empty splits.
    ///
    /// # Errors
    ///
    /// Returns a resource error when the next split cannot be opened.
    pub fn rotate_if_due(
        &mut self,
        counters: &TransformCounters,
    ) -> Result<Option<PathBuf>, TransformError> {
        let split_every = self.naming.split_every;
        let written = counters.lines_output();
        let due = split_every > 0
            && written > 0
            && written % split_every == 0
            && self.current.as_ref().is_some_and(|h| h.rows > 0);
        if !due {
            return Ok(None);
        }
        self.close(counters);
        self.open_next().map(Some)
    }

    /// Write `text` once per run, before any row.
    ///
    /// # Errors
    ///
    /// Returns a resource error when the handle cannot be opened, or a data
    /// error when the write fails.
    pub fn write_preamble(
        &mut self,
        counters: &TransformCounters,
        text: &str,
    ) -> Result<bool, TransformError> {
        if self.preamble_written || counters.lines_output() > 0 {
            return Ok(false);
        }
        self.ensure_open()?;
        self.write_bytes(text)?;
        self.preamble_written = true;
        Ok(true)
    }

    /// Write one row's text to the current handle.
    ///
    /// # Errors
    ///
    /// Returns a resource error when the handle cannot be opened, or a data
    /// error when encoding or writing fails.
    pub fn write_row(&mut self, text: &str) -> Result<(), TransformError> {
        self.ensure_open()?;
        self.write_bytes(text)?;
        if let Some(handle) = self.current.as_mut() {
            handle.rows += 1;
        }
        Ok(())
    }

    fn write_bytes(&mut self, text: &str) -> Result<(), TransformError> {
        let bytes = self.encoding.encode(text)?;
        let Some(handle) = self.current.as_mut() else {
            return Err(TransformError::internal("NO_OPEN_HANDLE", "no output handle is open"));
        };
        handle.writer.write_all(&bytes).map_err(|e| {
            TransformError::data(
                "WRITE_FAILED",
                format!("cannot write to {}: {e}", handle.path.display()),
            )
        })?;
        handle.bytes += bytes.len() as u64;
        Ok(())
    }

    /// Flush and close the current handle, if any.
    ///
    /// A failed flush increments the error counter and is logged; the
    /// handle is released either way and never reopened. Returns whether the
    /// close succeeded.
    pub fn close(&mut self, counters: &TransformCounters) -> bool {
        let Some(mut handle) = self.current.take() else {
            return true;
        };
        match handle.writer.flush() {
            Ok(()) => {
                tracing::debug!(
                    path = %handle.path.display(),
                    rows = handle.rows,
                    bytes = handle.bytes,
                    "Closed output file"
                );
                true
            }
            Err(e) => {
                counters.increment_errors();
                tracing::error!(
                    path = %handle.path.display(),
                    error = %e,
                    "Failed to close output file"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for SplitWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitWriter")
            .field("naming", &self.naming)
            .field("copy", &self.copy)
            .field("current", &self.current)
            .field("next_split", &self.next_split)
            .finish_non_exhaustive()
    }
}
