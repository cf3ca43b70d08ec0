//! Streaming LDIF reader.
//!
//! Handles folded lines, comments, the optional `version:` line, base64
//! (`::`) and file URL (`:<`) values, and change records. Records are
//! returned one at a time; nothing beyond the current record is buffered.

use std::io::BufRead;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rowpipe_types::error::TransformError;

/// Content type reported for plain entries.
pub const CONTENT_ATTRIBUTES: &str = "attributes";

const MODIFY_OPERATIONS: &[&str] = &["add", "delete", "replace", "increment"];

/// One LDIF entry or change record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdifRecord {
    pub dn: String,
    /// `changetype` of a change record, `None` for plain entries.
    pub change_type: Option<String>,
    attributes: Vec<(String, Vec<String>)>,
}

impl LdifRecord {
    /// `attributes`, or the change type for change records.
    pub fn content_type(&self) -> &str {
        self.change_type.as_deref().unwrap_or(CONTENT_ATTRIBUTES)
    }

    /// Values of `attribute` (case-insensitive), in file order.
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
            .map(|(_, values)| values.as_slice())
    }

    fn add(&mut self, attribute: &str, value: String) {
        match self
            .attributes
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
        {
            Some((_, values)) => values.push(value),
            None => self.attributes.push((attribute.to_string(), vec![value])),
        }
    }
}

pub struct LdifReader<R> {
    input: R,
    source: String,
    line_no: usize,
    peeked: Option<String>,
    exhausted: bool,
}

impl<R: BufRead> LdifReader<R> {
    /// `source` names the input in error messages.
    pub fn new(input: R, source: impl Into<String>) -> Self {
        Self {
            input,
            source: source.into(),
            line_no: 0,
            peeked: None,
            exhausted: false,
        }
    }

    fn malformed(&self, line_no: usize, detail: impl std::fmt::Display) -> TransformError {
        TransformError::resource(
            "MALFORMED_LDIF",
            format!("{} line {line_no}: {detail}", self.source),
        )
    }

    fn physical_line(&mut self) -> Result<Option<String>, TransformError> {
        if let Some(line) = self.peeked.take() {
            return Ok(Some(line));
        }
        if self.exhausted {
            return Ok(None);
        }
        let mut buf = String::new();
        let read = self.input.read_line(&mut buf).map_err(|e| {
            TransformError::resource("READ_FAILED", format!("cannot read {}: {e}", self.source))
        })?;
        if read == 0 {
            self.exhausted = true;
            return Ok(None);
        }
        self.line_no += 1;
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    /// Next line with continuation lines unfolded, and its starting line number.
    fn logical_line(&mut self) -> Result<Option<(usize, String)>, TransformError> {
        let Some(mut line) = self.physical_line()? else {
            return Ok(None);
        };
        let start = self.line_no;
        loop {
            match self.physical_line()? {
                Some(next) if next.starts_with(' ') => line.push_str(&next[1..]),
                Some(next) => {
                    self.peeked = Some(next);
                    break;
                }
                None => break,
            }
        }
        Ok(Some((start, line)))
    }

    fn record_lines(&mut self) -> Result<Vec<(usize, String)>, TransformError> {
        let mut lines = Vec::new();
        while let Some((no, line)) = self.logical_line()? {
            if line.trim().is_empty() {
                if lines.is_empty() {
                    continue;
                }
                break;
            }
            if line.starts_with('#') {
                continue;
            }
            lines.push((no, line));
        }
        Ok(lines)
    }

    /// Read the next record.
    ///
    /// # Errors
    ///
    /// `MALFORMED_LDIF` resource error for syntax errors, `READ_FAILED` for
    /// I/O errors.
    pub fn next_record(&mut self) -> Result<Option<LdifRecord>, TransformError> {
        loop {
            let mut lines = self.record_lines()?;
            if lines.is_empty() {
                return Ok(None);
            }
            if lines[0].1.to_ascii_lowercase().starts_with("version:") {
                lines.remove(0);
                if lines.is_empty() {
                    continue;
                }
            }
            return self.parse_record(lines).map(Some);
        }
    }

    fn parse_record(&self, lines: Vec<(usize, String)>) -> Result<LdifRecord, TransformError> {
        let mut record = LdifRecord::default();
        let mut iter = lines.into_iter();
        let Some((no, first)) = iter.next() else {
            return Err(self.malformed(self.line_no, "empty record"));
        };
        let (name, dn) = self.attribute_value(no, &first)?;
        if !name.eq_ignore_ascii_case("dn") {
            return Err(self.malformed(no, format!("record must start with 'dn:', found '{name}:'")));
        }
        record.dn = dn;

        for (no, line) in iter {
            if line == "-" {
                continue;
            }
            let (name, value) = self.attribute_value(no, &line)?;
            if name.eq_ignore_ascii_case("changetype") && record.change_type.is_none() {
                record.change_type = Some(value.to_ascii_lowercase());
                continue;
            }
            let in_modify = record.change_type.as_deref() == Some("modify");
            if in_modify && MODIFY_OPERATIONS.iter().any(|op| name.eq_ignore_ascii_case(op)) {
                continue;
            }
            record.add(&name, value);
        }
        Ok(record)
    }

    fn attribute_value(&self, no: usize, line: &str) -> Result<(String, String), TransformError> {
        let Some((name, rest)) = line.split_once(':') else {
            return Err(self.malformed(no, format!("expected 'attribute: value', found '{line}'")));
        };
        if name.is_empty() || name.starts_with(' ') {
            return Err(self.malformed(no, "missing attribute name"));
        }
        let value = if let Some(encoded) = rest.strip_prefix(':') {
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|e| self.malformed(no, format!("invalid base64 value for '{name}': {e}")))?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else if let Some(url) = rest.strip_prefix('<') {
            read_url(url.trim()).map_err(|e| self.malformed(no, e))?
        } else {
            rest.trim_start_matches(' ').to_string()
        };
        Ok((name.to_string(), value))
    }
}

/// Content of a `file://` URL; other schemes are kept as text.
fn read_url(url: &str) -> Result<String, String> {
    let Some(path) = url.strip_prefix("file://") else {
        return Ok(url.to_string());
    };
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| format!("cannot read {url}: {e}"))
}
