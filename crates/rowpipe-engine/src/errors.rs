//! Pipeline-level error model.

use rowpipe_types::error::TransformError;

/// Error that ended a pipeline run.
///
/// `Transform` wraps the first fatal error raised by a transform instance
/// (configuration, resource, unrouted row failure).
///
/// `Infrastructure` wraps host-side failures that are not attributable to a
/// transform: task panics, state backend errors, invalid pipeline files.
#[derive(Debug)]
pub enum PipelineError {
    Transform(TransformError),
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transform(e) => write!(f, "{e}"),
            Self::Infrastructure(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<TransformError> for PipelineError {
    fn from(e: TransformError) -> Self {
        Self::Transform(e)
    }
}

impl PipelineError {
    /// Returns the typed transform error if this is a `Transform` variant.
    pub fn as_transform_error(&self) -> Option<&TransformError> {
        match self {
            Self::Transform(e) => Some(e),
            Self::Infrastructure(_) => None,
        }
    }
}
