//! Serde model of a pipeline YAML file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error_router::ErrorHandlingConfig;

/// Top-level pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    /// Values for `${NAME}` and `%%NAME%%` placeholders; the process
    /// environment is consulted for names not listed here.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl PipelineConfig {
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.name == name)
    }
}

fn default_copies() -> usize {
    1
}

/// One node of the pipeline graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    /// Registry name of the transform implementing this step.
    #[serde(rename = "use")]
    pub use_ref: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// Parallel copies of this step.
    #[serde(default = "default_copies")]
    pub copies: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandlingConfig>,
    /// Transform-specific options, interpreted by the transform's factory.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl StepConfig {
    /// Step receiving this step's error rows, if routed to a step.
    #[must_use]
    pub fn error_target(&self) -> Option<&str> {
        self.error_handling
            .as_ref()
            .filter(|h| h.enabled)
            .and_then(|h| h.target.as_deref())
    }
}

fn default_row_buffer_size() -> usize {
    10_000
}

fn default_feedback_size() -> u64 {
    50_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Capacity of each row channel.
    #[serde(default = "default_row_buffer_size")]
    pub row_buffer_size: usize,
    /// Rows between progress log lines; 0 disables them.
    #[serde(default = "default_feedback_size")]
    pub feedback_size: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            row_buffer_size: default_row_buffer_size(),
            feedback_size: default_feedback_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// Database path; defaults to `~/.rowpipe/state.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
}
