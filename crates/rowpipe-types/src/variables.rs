//! Variable substitution for filenames, field names and other options.
//!
//! Both `${NAME}` and `%%NAME%%` are recognised. Unknown variables are left
//! in place so a missing value shows up verbatim instead of silently
//! collapsing to an empty string.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)\}|%%([A-Za-z_][A-Za-z0-9_.\-]*)%%")
        .expect("valid variable regex")
});

/// Source of variable values.
pub trait Variables: Send + Sync {
    /// Look up a single variable.
    fn get(&self, name: &str) -> Option<String>;

    /// Replace every known variable reference in `input`.
    fn resolve(&self, input: &str) -> String {
        if !input.contains("${") && !input.contains("%%") {
            return input.to_string();
        }
        VARIABLE_RE
            .replace_all(input, |caps: &Captures<'_>| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map_or("", |m| m.as_str());
                self.get(name).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

/// Pipeline-scoped variables, optionally falling back to the process environment.
#[derive(Debug, Clone, Default)]
pub struct VariableSpace {
    values: BTreeMap<String, String>,
    include_env: bool,
}

impl VariableSpace {
    /// Empty space that does not consult the environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Space over `values` that falls back to the process environment.
    #[must_use]
    pub fn with_env(values: BTreeMap<String, String>) -> Self {
        Self {
            values,
            include_env: true,
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

impl Variables for VariableSpace {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned().or_else(|| {
            if self.include_env {
                std::env::var(name).ok()
            } else {
                None
            }
        })
    }
}
