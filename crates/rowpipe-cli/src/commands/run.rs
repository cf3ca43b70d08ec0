use std::path::Path;

use anyhow::{Context, Result};
use rowpipe_engine::config::parser;
use rowpipe_engine::instance::InstanceOutcome;
use rowpipe_engine::{run_pipeline, ExecutionOptions, PipelineResult};
use rowpipe_types::state::RunStatus;
use tokio_util::sync::CancellationToken;

use crate::registry;

/// Execute the `run` command: parse, run and report a pipeline.
///
/// Ctrl-C stops the run; rows already in flight are dropped and the run is
/// reported as stopped.
pub async fn execute(pipeline_path: &Path, dry_run: bool) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    let registry = registry::bundled();

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping pipeline");
            stop.cancel();
        }
    });

    let options = ExecutionOptions {
        dry_run,
        ..ExecutionOptions::default()
    }
    .with_cancel(cancel);
    let outcome = run_pipeline(&config, &registry, &options).await;
    signal.abort();
    let result = outcome?;

    print_summary(&result);
    if result.status == RunStatus::Failed {
        anyhow::bail!("Pipeline '{}' failed", result.pipeline);
    }
    Ok(())
}

fn print_summary(result: &PipelineResult) {
    println!("Pipeline '{}' {}.", result.pipeline, result.status);
    if let Some(run_id) = result.run_id {
        println!("  Run id:          {run_id}");
    }
    println!("  Duration:        {:.2}s", result.duration_secs);

    let totals = result.totals();
    println!("  Rows read:       {}", totals.lines_read);
    println!("  Rows written:    {}", totals.lines_written);
    println!("  Rows input:      {}", totals.lines_input);
    println!("  Rows output:     {}", totals.lines_output);
    println!("  Rows rejected:   {}", totals.lines_rejected);
    println!("  Errors:          {}", totals.errors);

    println!("  Steps:");
    for step in &result.steps {
        let outcome = match &step.outcome {
            InstanceOutcome::Completed => "completed".to_string(),
            InstanceOutcome::Cancelled => "stopped".to_string(),
            InstanceOutcome::DownstreamClosed => "downstream closed".to_string(),
            InstanceOutcome::Failed(e) => format!("failed: {e}"),
        };
        println!(
            "    {}.{:<3} in={} out={} rejected={} errors={} ({:.2}s) {}",
            step.step_name,
            step.copy,
            step.counters.lines_input.max(step.counters.lines_read),
            step.counters.lines_written,
            step.counters.lines_rejected,
            step.counters.errors,
            step.duration_secs,
            outcome,
        );
    }

    if !result.error_records.is_empty() {
        println!("  Error records:   {}", result.error_records.len());
        for record in &result.error_records {
            println!(
                "    {}.{} {}: {} {}",
                record.step_name, record.copy, record.error_code, record.error_message, record.record_json
            );
        }
    }

    if !result.dry_run_files.is_empty() {
        println!("  Files (dry run):");
        for (path, size) in &result.dry_run_files {
            println!("    {} ({size} B)", path.display());
        }
    } else if !result.result_files.is_empty() {
        println!("  Files:");
        for file in &result.result_files {
            println!("    {} [{}]", file.path.display(), file.step_name);
        }
    }

    let json = serde_json::json!({
        "pipeline": result.pipeline,
        "status": result.status.as_str(),
        "duration_secs": result.duration_secs,
        "lines_read": totals.lines_read,
        "lines_written": totals.lines_written,
        "lines_rejected": totals.lines_rejected,
        "errors": totals.errors,
        "error_records": result.error_records.len(),
    });
    tracing::debug!(summary = %json, "Run summary");
}
