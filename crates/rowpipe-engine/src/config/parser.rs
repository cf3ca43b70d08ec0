//! Pipeline YAML loading and saving.
//!
//! Placeholders such as `${OUT_DIR}` are kept verbatim; steps resolve them
//! through their variable space when a value is used.

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::types::PipelineConfig;

/// Parse a pipeline YAML string.
///
/// # Errors
///
/// Returns an error if the YAML is invalid or does not match the model.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineConfig> {
    let config: PipelineConfig =
        serde_yaml::from_str(yaml_str).context("Failed to parse pipeline YAML")?;
    Ok(config)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
}

/// Render a pipeline back to YAML.
///
/// # Errors
///
/// Returns an error if a step's `config` value cannot be represented in YAML.
pub fn serialize_pipeline(config: &PipelineConfig) -> Result<String> {
    serde_yaml::to_string(config).context("Failed to serialize pipeline YAML")
}
