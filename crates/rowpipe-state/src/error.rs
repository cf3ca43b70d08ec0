//! Errors of the run history store.

/// Failure of a [`StateBackend`](crate::StateBackend) call.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state store failed to {operation}: {source}")]
    Sqlite {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("cannot create state store directory: {0}")]
    Io(#[from] std::io::Error),

    /// A thread panicked while holding the connection.
    #[error("state store connection lock poisoned")]
    LockPoisoned,
}

impl StateError {
    #[must_use]
    pub fn sqlite(operation: &'static str, source: rusqlite::Error) -> Self {
        Self::Sqlite { operation, source }
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_failure_names_the_operation() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("no such table: pipeline_runs".into()),
        );
        let msg = StateError::sqlite("record run start", inner).to_string();
        assert!(msg.starts_with("state store failed to record run start"), "got: {msg}");
        assert!(msg.contains("pipeline_runs"), "got: {msg}");
    }

    #[test]
    fn directory_failure_is_io() {
        let err: StateError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, StateError::Io(_)));
        assert!(err.to_string().contains("directory"));
    }
}
