//! State backend trait definition.
//!
//! [`StateBackend`] defines the storage contract for run history and error
//! records. Model types live in [`rowpipe_types::state`].

use rowpipe_types::envelope::ErrorRecord;
use rowpipe_types::state::{PipelineId, RunStats, RunStatus};

use crate::error;

/// Storage contract for pipeline state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
pub trait StateBackend: Send + Sync {
    /// Begin a new run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64>;

    /// Finalize a run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()>;

    /// Persist routed error records. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn insert_error_records(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[ErrorRecord],
    ) -> error::Result<u64>;
}
