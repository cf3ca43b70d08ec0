use std::path::Path;

use anyhow::{Context, Result};
use rowpipe_engine::check_pipeline;
use rowpipe_engine::config::parser;
use rowpipe_types::error::{ValidationResult, ValidationStatus};

use crate::registry;

/// Execute the `check` command: validate the graph and every step's configuration.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    let registry = registry::bundled();

    let result = check_pipeline(&config, &registry).await?;

    match &result.pipeline_errors {
        None => println!("Pipeline structure: OK"),
        Some(errors) => {
            println!("Pipeline structure: FAILED");
            println!("  {errors}");
        }
    }
    for (name, validation) in &result.steps {
        print_validation(&format!("Step '{name}'"), validation);
    }
    if result.state_ok {
        println!("State backend:     OK");
    } else {
        println!("State backend:     FAILED");
    }

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_validation(label: &str, result: &ValidationResult) {
    let status = match result.status {
        ValidationStatus::Success => "OK",
        ValidationStatus::Failed => "FAILED",
        ValidationStatus::Warning => "WARNING",
    };
    println!("{:18} {}", format!("{label}:"), status);
    if !result.message.is_empty() {
        println!("  {}", result.message);
    }
}
