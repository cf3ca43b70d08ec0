//! Pipeline orchestrator: wires step instances, runs them and finalizes state.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use rowpipe_state::{SqliteStateBackend, StateBackend};
use rowpipe_types::envelope::ErrorRecord;
use rowpipe_types::error::{TransformError, ValidationResult};
use rowpipe_types::state::{PipelineId, RunStats, RunStatus};
use rowpipe_types::variables::{VariableSpace, Variables};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::channel::{row_channel, Downstream, Frame, RowOutput, RowReceiver};
use crate::config::types::{PipelineConfig, StateBackendKind, StepConfig};
use crate::config::validator::{topological_order, validate_pipeline};
use crate::error_router::{ErrorCollector, ErrorRouter, ErrorSink};
use crate::errors::PipelineError;
use crate::execution::ExecutionOptions;
use crate::instance::{InstanceOutcome, InstanceReport, TransformInstance};
use crate::registry::TransformRegistry;
use crate::resource::{LocalFileTarget, MemoryTarget, OutputTarget, ResultFiles};
use crate::result::{CheckResult, PipelineResult, StepMetric};
use crate::transform::{StepContext, StepRole};

/// Run-wide collaborators shared by every instance.
struct RunShared {
    variables: Arc<dyn Variables>,
    target: Arc<dyn OutputTarget>,
    result_files: ResultFiles,
    collector: ErrorCollector,
}

struct Collected {
    reports: Vec<InstanceReport>,
    panic: Option<PipelineError>,
}

/// Run a pipeline to completion, stop or first fatal error.
///
/// # Errors
///
/// Returns `PipelineError::Transform` with the first fatal transform error
/// (by finish time), or `PipelineError::Infrastructure` for invalid pipeline
/// files, state store failures and panicked tasks.
pub async fn run_pipeline(
    config: &PipelineConfig,
    registry: &TransformRegistry,
    options: &ExecutionOptions,
) -> Result<PipelineResult, PipelineError> {
    let start = Instant::now();
    validate_pipeline(config, registry).map_err(|e| {
        PipelineError::Transform(TransformError::config("INVALID_PIPELINE", format!("{e:#}")))
    })?;

    tracing::info!(
        pipeline = config.pipeline,
        steps = config.steps.len(),
        dry_run = options.dry_run,
        "Starting pipeline run"
    );

    let memory = options.dry_run.then(MemoryTarget::new);
    let target: Arc<dyn OutputTarget> = match &memory {
        Some(memory) => Arc::new(memory.clone()),
        None => Arc::new(LocalFileTarget),
    };
    let shared = RunShared {
        variables: Arc::new(VariableSpace::with_env(config.variables.clone())),
        target,
        result_files: ResultFiles::new(),
        collector: ErrorCollector::new(),
    };

    let state = if options.dry_run {
        None
    } else {
        create_state_backend(config)?
    };
    let pipeline_id = PipelineId::new(config.pipeline.clone());
    let run_id = match &state {
        Some(state) => Some(start_run(Arc::clone(state), pipeline_id.clone()).await?),
        None => None,
    };

    let operator = options.cancel.clone().unwrap_or_default();
    let cancel = operator.child_token();

    let instances = match build_instances(config, registry, &shared, &cancel) {
        Ok(instances) => instances,
        Err(error) => {
            tracing::error!(
                pipeline = config.pipeline,
                code = %error.code,
                "Failed to build pipeline: {}",
                error.message
            );
            if let (Some(state), Some(run_id)) = (&state, run_id) {
                let stats = RunStats {
                    errors: 1,
                    error_message: Some(error.to_string()),
                    ..RunStats::default()
                };
                complete_run(Arc::clone(state), run_id, RunStatus::Failed, stats).await?;
            }
            return Err(PipelineError::Transform(error));
        }
    };

    let mut join_set = JoinSet::new();
    for instance in instances {
        join_set.spawn_blocking(move || instance.execute());
    }
    let collected = collect_reports(join_set, &cancel).await;

    let order: HashMap<&str, usize> = config
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();
    let mut reports = collected.reports;
    reports.sort_by_key(|r| (order.get(r.step_name.as_str()).copied(), r.copy));

    let first_fatal = reports
        .iter()
        .filter_map(|r| match &r.outcome {
            InstanceOutcome::Failed(error) => Some((r.finished_at, error.clone())),
            _ => None,
        })
        .min_by_key(|(finished_at, _)| *finished_at)
        .map(|(_, error)| error)
        .or_else(|| {
            reports
                .iter()
                .find(|r| r.outcome == InstanceOutcome::DownstreamClosed)
                .map(|r| {
                    TransformError::internal(
                        "DOWNSTREAM_CLOSED",
                        format!(
                            "step '{}' copy {} lost its downstream before its input ended",
                            r.step_name, r.copy
                        ),
                    )
                })
        });
    let stopped = operator.is_cancelled()
        || reports
            .iter()
            .any(|r| r.outcome == InstanceOutcome::Cancelled);

    let steps: Vec<StepMetric> = reports
        .into_iter()
        .map(|r| StepMetric {
            step_name: r.step_name,
            copy: r.copy,
            outcome: r.outcome,
            counters: r.counters,
            duration_secs: r.duration_secs,
        })
        .collect();
    let error_records = shared.collector.take();

    let failure: Option<PipelineError> = collected
        .panic
        .or_else(|| first_fatal.map(PipelineError::Transform));
    let status = match (&failure, stopped) {
        (Some(_), _) => RunStatus::Failed,
        (None, true) => RunStatus::Stopped,
        (None, false) => RunStatus::Completed,
    };

    let mut result = PipelineResult {
        pipeline: config.pipeline.clone(),
        status,
        duration_secs: 0.0,
        steps,
        error_records,
        result_files: shared.result_files.to_vec(),
        dry_run_files: memory.map(|m| m.files()).unwrap_or_default(),
        run_id,
    };
    let totals = result.totals();

    if let (Some(state), Some(run_id)) = (&state, run_id) {
        let stats = RunStats {
            rows_read: totals.lines_input,
            rows_written: totals.lines_output,
            rows_rejected: totals.lines_rejected,
            errors: totals.errors,
            error_message: failure.as_ref().map(ToString::to_string),
        };
        complete_run(Arc::clone(state), run_id, status, stats).await?;
        persist_records(
            Arc::clone(state),
            pipeline_id.clone(),
            run_id,
            result.error_records.clone(),
        )
        .await?;
    }

    if let Some(err) = failure {
        tracing::error!(pipeline = config.pipeline, "Pipeline failed: {}", err);
        return Err(err);
    }

    result.duration_secs = start.elapsed().as_secs_f64();
    if status == RunStatus::Stopped {
        tracing::warn!(pipeline = config.pipeline, "Pipeline stopped before completion");
    }
    tracing::info!(
        pipeline = config.pipeline,
        status = %status,
        lines_input = totals.lines_input,
        lines_output = totals.lines_output,
        lines_rejected = totals.lines_rejected,
        duration_secs = result.duration_secs,
        "Pipeline run finished"
    );
    Ok(result)
}

/// Copies of `step`'s upstream instances: data producers plus every step
/// routing its errors here. Each sends its own end-of-stream.
fn producer_count(config: &PipelineConfig, step: &StepConfig) -> usize {
    let data: usize = step
        .inputs
        .iter()
        .filter_map(|i| config.step(i))
        .map(|s| s.copies)
        .sum();
    let errors: usize = config
        .steps
        .iter()
        .filter(|s| s.error_target() == Some(step.name.as_str()))
        .map(|s| s.copies)
        .sum();
    data + errors
}

fn build_instances(
    config: &PipelineConfig,
    registry: &TransformRegistry,
    shared: &RunShared,
    cancel: &CancellationToken,
) -> Result<Vec<TransformInstance>, TransformError> {
    let capacity = config.resources.row_buffer_size;
    let mut senders: HashMap<&str, Vec<mpsc::Sender<Frame>>> = HashMap::new();
    let mut receivers: HashMap<&str, VecDeque<RowReceiver>> = HashMap::new();
    for step in &config.steps {
        if registry.role(&step.use_ref) == Some(StepRole::Source) {
            continue;
        }
        let producers = producer_count(config, step);
        let (txs, rxs): (Vec<_>, VecDeque<_>) = (0..step.copies)
            .map(|_| row_channel(capacity, producers))
            .unzip();
        senders.insert(step.name.as_str(), txs);
        receivers.insert(step.name.as_str(), rxs);
    }

    let mut instances = Vec::new();
    for name in topological_order(config) {
        let Some(step) = config.step(&name) else {
            continue;
        };
        let mut inputs = receivers.remove(step.name.as_str()).unwrap_or_default();
        for copy in 0..step.copies {
            let built = registry
                .build(&step.use_ref, &step.config)
                .map_err(|e| TransformError {
                    message: format!("step '{}': {}", step.name, e.message),
                    ..e
                })?;
            let downstreams = config
                .steps
                .iter()
                .filter(|d| d.inputs.iter().any(|i| *i == step.name))
                .filter_map(|d| {
                    senders
                        .get(d.name.as_str())
                        .map(|txs| Downstream::new(&d.name, txs.clone()))
                })
                .collect();
            let ctx = StepContext::new(
                &step.name,
                copy,
                Arc::clone(&shared.variables),
                Arc::clone(&shared.target),
            )
            .with_result_files(shared.result_files.clone());
            let instance = TransformInstance::new(
                ctx,
                built,
                inputs.pop_front(),
                RowOutput::new(downstreams),
                error_router(step, &senders, &shared.collector),
                cancel.clone(),
            )
            .with_feedback_size(config.resources.feedback_size);
            instances.push(instance);
        }
    }
    Ok(instances)
}

fn error_router(
    step: &StepConfig,
    senders: &HashMap<&str, Vec<mpsc::Sender<Frame>>>,
    collector: &ErrorCollector,
) -> ErrorRouter {
    let Some(handling) = step.error_handling.as_ref().filter(|h| h.enabled) else {
        return ErrorRouter::disabled();
    };
    let sink = match step.error_target().and_then(|t| senders.get(t).map(|txs| (t, txs))) {
        Some((target, txs)) => {
            ErrorSink::Step(RowOutput::new(vec![Downstream::new(target, txs.clone())]))
        }
        None => ErrorSink::Collector(collector.clone()),
    };
    ErrorRouter::new(handling.clone(), sink)
}

async fn collect_reports(
    mut join_set: JoinSet<InstanceReport>,
    cancel: &CancellationToken,
) -> Collected {
    let mut reports = Vec::new();
    let mut panic = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(join_err) => {
                tracing::error!("Instance task panicked: {}", join_err);
                cancel.cancel();
                if panic.is_none() {
                    panic = Some(PipelineError::Infrastructure(anyhow::anyhow!(
                        "Instance task panicked: {join_err}"
                    )));
                }
            }
        }
    }
    Collected { reports, panic }
}

fn create_state_backend(config: &PipelineConfig) -> Result<Option<Arc<dyn StateBackend>>> {
    match config.state.backend {
        StateBackendKind::None => Ok(None),
        StateBackendKind::Sqlite => {
            let path = match &config.state.connection {
                Some(path) => PathBuf::from(path),
                None => {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                    PathBuf::from(home).join(".rowpipe").join("state.db")
                }
            };
            let backend = SqliteStateBackend::open(Path::new(&path))
                .with_context(|| format!("Failed to open state DB: {}", path.display()))?;
            Ok(Some(Arc::new(backend) as Arc<dyn StateBackend>))
        }
    }
}

fn check_state_backend(config: &PipelineConfig) -> bool {
    match create_state_backend(config) {
        Ok(_) => {
            tracing::info!("State backend: OK");
            true
        }
        Err(e) => {
            tracing::error!("State backend: FAILED: {:#}", e);
            false
        }
    }
}

async fn start_run(
    state: Arc<dyn StateBackend>,
    pipeline_id: PipelineId,
) -> Result<i64, PipelineError> {
    tokio::task::spawn_blocking(move || state.start_run(&pipeline_id))
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("start_run task panicked: {e}")))?
        .map_err(|e| PipelineError::Infrastructure(e.into()))
}

async fn complete_run(
    state: Arc<dyn StateBackend>,
    run_id: i64,
    status: RunStatus,
    stats: RunStats,
) -> Result<(), PipelineError> {
    tokio::task::spawn_blocking(move || state.complete_run(run_id, status, &stats))
        .await
        .map_err(|e| {
            PipelineError::Infrastructure(anyhow::anyhow!("complete_run task panicked: {e}"))
        })?
        .map_err(|e| PipelineError::Infrastructure(e.into()))
}

async fn persist_records(
    state: Arc<dyn StateBackend>,
    pipeline_id: PipelineId,
    run_id: i64,
    records: Vec<ErrorRecord>,
) -> Result<(), PipelineError> {
    if records.is_empty() {
        return Ok(());
    }
    tokio::task::spawn_blocking(move || {
        match state.insert_error_records(&pipeline_id, run_id, &records) {
            Ok(inserted) => tracing::info!(
                pipeline = pipeline_id.as_str(),
                run_id,
                error_records = inserted,
                "Stored error records"
            ),
            // A storage failure leaves the run outcome unchanged.
            Err(e) => tracing::error!(
                pipeline = pipeline_id.as_str(),
                run_id,
                count = records.len(),
                error = %e,
                "Failed to store error records"
            ),
        }
    })
    .await
    .map_err(|e| {
        PipelineError::Infrastructure(anyhow::anyhow!("persist_error_records task panicked: {e}"))
    })
}

/// Validate a pipeline without running it: graph checks, step
/// construction, each step's own `validate`, and the state backend.
///
/// # Errors
///
/// Currently infallible; kept fallible for checks that need I/O.
pub async fn check_pipeline(
    config: &PipelineConfig,
    registry: &TransformRegistry,
) -> Result<CheckResult> {
    tracing::info!(pipeline = config.pipeline, "Checking pipeline configuration");

    let pipeline_errors = validate_pipeline(config, registry)
        .err()
        .map(|e| format!("{e:#}"));
    let variables = VariableSpace::with_env(config.variables.clone());

    let mut steps = Vec::with_capacity(config.steps.len());
    for step in &config.steps {
        let validation = match registry.build(&step.use_ref, &step.config) {
            Ok(built) => built.validate(&variables),
            Err(e) => ValidationResult::failed(e.to_string()),
        };
        tracing::info!(
            step = step.name,
            status = ?validation.status,
            "{}",
            validation.message
        );
        steps.push((step.name.clone(), validation));
    }

    let state_ok = check_state_backend(config);
    Ok(CheckResult {
        pipeline_errors,
        steps,
        state_ok,
    })
}
