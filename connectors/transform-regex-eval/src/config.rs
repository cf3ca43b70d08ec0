use regex::{Regex, RegexBuilder};
use rowpipe_types::error::TransformError;
use rowpipe_types::options::FieldList;
use rowpipe_types::variables::Variables;
use serde::{Deserialize, Serialize};

fn default_result_field() -> String {
    "result".to_string()
}

fn default_true() -> bool {
    true
}

/// `regex-eval` step configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Pattern; the whole field value must match it.
    #[serde(default)]
    pub script: String,
    /// Field whose string form is evaluated.
    #[serde(default)]
    pub matcher: String,
    #[serde(default = "default_result_field")]
    pub result_field: String,
    /// Resolve `${VAR}` references inside `script`.
    #[serde(default)]
    pub use_variables: bool,
    #[serde(default)]
    pub allow_capture_groups: bool,
    /// Overwrite existing fields of the same name instead of failing.
    #[serde(default = "default_true")]
    pub replace_fields: bool,
    #[serde(default)]
    pub case_insensitive: bool,
    /// Whitespace and `#` comments in the pattern are ignored.
    #[serde(default)]
    pub comments: bool,
    #[serde(default)]
    pub dot_all: bool,
    #[serde(default)]
    pub multiline: bool,
    /// Matching is always Unicode-aware; kept so saved configurations load.
    #[serde(default)]
    pub unicode: bool,
    /// Accepted for compatibility; `\n` is the only line terminator anyway.
    #[serde(default)]
    pub unix_lines: bool,
    /// Accepted for compatibility; no effect.
    #[serde(default)]
    pub canonical_eq: bool,
    /// Capture group targets, one per group, in group order.
    #[serde(default)]
    pub fields: FieldList,
}

impl Config {
    /// Pattern text after optional variable substitution.
    pub fn pattern(&self, variables: &dyn Variables) -> String {
        if self.use_variables {
            variables.resolve(&self.script)
        } else {
            self.script.clone()
        }
    }

    /// Compile the pattern anchored at both ends with the configured flags.
    ///
    /// The anchors bind to the whole value, so `multiline` only changes what
    /// `^` and `$` mean inside the pattern.
    ///
    /// # Errors
    ///
    /// `INVALID_REGEX` configuration error when the pattern does not compile.
    pub fn compile(&self, variables: &dyn Variables) -> Result<Regex, TransformError> {
        let pattern = self.pattern(variables);
        // A trailing `#` comment would swallow the closing group in verbose mode.
        let anchored = if self.comments {
            format!("\\A(?:{pattern}\n)\\z")
        } else {
            format!("\\A(?:{pattern})\\z")
        };
        RegexBuilder::new(&anchored)
            .case_insensitive(self.case_insensitive)
            .ignore_whitespace(self.comments)
            .dot_matches_new_line(self.dot_all)
            .multi_line(self.multiline)
            .build()
            .map_err(|e| {
                TransformError::config("INVALID_REGEX", format!("invalid pattern '{pattern}': {e}"))
            })
    }

    /// Static problems, empty when the configuration is usable.
    pub fn problems(&self, variables: &dyn Variables) -> Vec<String> {
        let mut problems = Vec::new();
        if self.matcher.trim().is_empty() {
            problems.push("no field to evaluate (matcher) is set".to_string());
        }
        if self.result_field.trim().is_empty() {
            problems.push("result field name is empty".to_string());
        }
        if self.script.is_empty() {
            problems.push("pattern (script) is empty".to_string());
        } else if let Err(e) = self.compile(variables) {
            problems.push(e.message);
        }
        problems
    }
}
