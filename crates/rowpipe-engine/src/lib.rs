//! Streaming execution engine for rowpipe pipelines.
//!
//! Each configured step runs as one or more [`instance::TransformInstance`]s
//! on blocking tasks, connected by bounded row channels. The
//! [`orchestrator`] wires the graph, drives every instance through
//! init → run → dispose and aggregates the outcome.

pub mod channel;
pub mod config;
pub mod convert;
pub mod counters;
pub mod error_router;
pub mod errors;
pub mod execution;
pub mod files;
pub mod instance;
pub mod orchestrator;
pub mod registry;
pub mod resource;
pub mod result;
pub mod transform;

pub use errors::PipelineError;
pub use execution::ExecutionOptions;
pub use orchestrator::{check_pipeline, run_pipeline};
pub use registry::TransformRegistry;
pub use result::{CheckResult, PipelineResult};
