//! Execution mode types for pipeline runs.

use tokio_util::sync::CancellationToken;

/// Runtime execution options (not part of pipeline YAML config).
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Send all file output to memory and report sizes instead of writing.
    pub dry_run: bool,
    /// Operator stop signal. Cancelling it stops the run with status
    /// `stopped` instead of an error.
    pub cancel: Option<CancellationToken>,
}

impl ExecutionOptions {
    #[must_use]
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}
