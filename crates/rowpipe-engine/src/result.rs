//! Pipeline execution result types.

use std::path::PathBuf;

use rowpipe_types::envelope::ErrorRecord;
use rowpipe_types::error::{ValidationResult, ValidationStatus};
use rowpipe_types::metric::CounterSnapshot;
use rowpipe_types::state::RunStatus;

use crate::instance::InstanceOutcome;
use crate::resource::ResultFile;

/// Counters of one step copy at the end of a run.
#[derive(Debug, Clone)]
pub struct StepMetric {
    pub step_name: String,
    pub copy: usize,
    pub outcome: InstanceOutcome,
    pub counters: CounterSnapshot,
    pub duration_secs: f64,
}

/// Result of a pipeline run that was not ended by a fatal error.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub pipeline: String,
    /// `Completed`, or `Stopped` after an operator stop.
    pub status: RunStatus,
    pub duration_secs: f64,
    /// One entry per step copy, in pipeline order.
    pub steps: Vec<StepMetric>,
    /// Routed failures without a target step.
    pub error_records: Vec<ErrorRecord>,
    /// Files steps asked to add to the result.
    pub result_files: Vec<ResultFile>,
    /// Files written to memory in a dry run, with their sizes in bytes.
    pub dry_run_files: Vec<(PathBuf, u64)>,
    pub run_id: Option<i64>,
}

impl PipelineResult {
    /// Counters summed over every step copy.
    #[must_use]
    pub fn totals(&self) -> CounterSnapshot {
        self.steps
            .iter()
            .fold(CounterSnapshot::default(), |acc, s| acc.merged(s.counters))
    }

    /// Counters summed over the copies of one step.
    #[must_use]
    pub fn step_totals(&self, step_name: &str) -> CounterSnapshot {
        self.steps
            .iter()
            .filter(|s| s.step_name == step_name)
            .fold(CounterSnapshot::default(), |acc, s| acc.merged(s.counters))
    }
}

/// Result of a pipeline check.
#[derive(Debug)]
pub struct CheckResult {
    /// Graph validation problems; empty when the graph is valid.
    pub pipeline_errors: Option<String>,
    /// Per-step configuration check, in pipeline order.
    pub steps: Vec<(String, ValidationResult)>,
    pub state_ok: bool,
}

impl CheckResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.pipeline_errors.is_none()
            && self.state_ok
            && self
                .steps
                .iter()
                .all(|(_, v)| v.status != ValidationStatus::Failed)
    }
}
