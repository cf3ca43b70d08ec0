//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rowpipe_types::envelope::ErrorRecord;
use rowpipe_types::state::{PipelineId, RunStats, RunStatus};
use rusqlite::Connection;

use crate::backend::StateBackend;
use crate::error::{self, StateError};

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    rows_read INTEGER DEFAULT 0,
    rows_written INTEGER DEFAULT 0,
    rows_rejected INTEGER DEFAULT 0,
    errors INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS error_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id),
    step_name TEXT NOT NULL,
    copy_nr INTEGER NOT NULL,
    record_json TEXT NOT NULL,
    error_code TEXT NOT NULL,
    error_message TEXT NOT NULL,
    origin_field TEXT,
    error_category TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_error_records_pipeline_run ON error_records (pipeline, run_id);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| StateError::sqlite("open the database", e))?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` backend.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the schema can't be created.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::sqlite("open the database", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::sqlite("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    #[cfg(test)]
    fn get_run_row(&self, run_id: i64) -> error::Result<(String, i64, i64, Option<String>, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT status, rows_read, rows_rejected, finished_at, error_message \
             FROM pipeline_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .map_err(|e| StateError::sqlite("read a run", e))
    }

    #[cfg(test)]
    fn count_error_records_for_run(&self, pipeline: &PipelineId, run_id: i64) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM error_records WHERE pipeline = ?1 AND run_id = ?2",
            rusqlite::params![pipeline.as_str(), run_id],
            |row| row.get(0),
        )
        .map_err(|e| StateError::sqlite("count error records", e))
    }

    #[cfg(test)]
    fn first_error_record(&self, pipeline: &PipelineId) -> error::Result<(String, String, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT step_name, error_code, origin_field FROM error_records \
             WHERE pipeline = ?1 ORDER BY id LIMIT 1",
            rusqlite::params![pipeline.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|e| StateError::sqlite("read an error record", e))
    }
}

impl StateBackend for SqliteStateBackend {
    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pipeline_runs (pipeline, status) VALUES (?1, ?2)",
            rusqlite::params![pipeline.as_str(), RunStatus::Running.as_str()],
        )
        .map_err(|e| StateError::sqlite("record run start", e))?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE pipeline_runs SET status = ?1, finished_at = datetime('now'), \
             rows_read = ?2, rows_written = ?3, rows_rejected = ?4, errors = ?5, \
             error_message = ?6 WHERE id = ?7",
            rusqlite::params![
                status.as_str(),
                stats.rows_read as i64,
                stats.rows_written as i64,
                stats.rows_rejected as i64,
                stats.errors as i64,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::sqlite("record run completion", e))?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn insert_error_records(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[ErrorRecord],
    ) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::sqlite("begin storing error records", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO error_records \
                 (pipeline, run_id, step_name, copy_nr, record_json, error_code, \
                  error_message, origin_field, error_category, failed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .map_err(|e| StateError::sqlite("prepare the error record insert", e))?;

        let mut count = 0u64;
        for record in records {
            stmt.execute(rusqlite::params![
                pipeline.as_str(),
                run_id,
                record.step_name,
                record.copy as i64,
                record.record_json,
                record.error_code,
                record.error_message,
                record.origin_field,
                record.error_category.as_str(),
                record.failed_at.as_str(),
            ])
            .map_err(|e| StateError::sqlite("insert an error record", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::sqlite("commit error records", e))?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowpipe_types::envelope::Timestamp;
    use rowpipe_types::error::ErrorCategory;
    use rowpipe_types::value::{Row, Value};

    fn pid(name: &str) -> PipelineId {
        PipelineId::new(name)
    }

    fn record(step: &str, code: &str, field: Option<&str>) -> ErrorRecord {
        ErrorRecord {
            step_name: step.into(),
            copy: 0,
            row: Row::new(vec![Value::from("abc")]),
            record_json: r#"{"amount":"abc"}"#.into(),
            error_code: code.into(),
            error_message: "not a number".into(),
            origin_field: field.map(str::to_string),
            error_category: ErrorCategory::Data,
            failed_at: Timestamp::new("2026-02-21T12:00:00+00:00"),
        }
    }

    #[test]
    fn run_lifecycle() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.start_run(&pid("p")).unwrap();
        assert!(run_id > 0);

        backend
            .complete_run(
                run_id,
                RunStatus::Completed,
                &RunStats {
                    rows_read: 1000,
                    rows_written: 990,
                    rows_rejected: 10,
                    errors: 0,
                    error_message: None,
                },
            )
            .unwrap();

        let (status, rows_read, rejected, finished, _error) = backend.get_run_row(run_id).unwrap();
        assert_eq!(status, "completed");
        assert_eq!(rows_read, 1000);
        assert_eq!(rejected, 10);
        assert!(finished.is_some());
    }

    #[test]
    fn run_failure() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.start_run(&pid("p")).unwrap();

        backend
            .complete_run(
                run_id,
                RunStatus::Failed,
                &RunStats {
                    rows_read: 50,
                    errors: 1,
                    error_message: Some("[resource] OPEN_FAILED: permission denied".into()),
                    ..RunStats::default()
                },
            )
            .unwrap();

        let (status, _read, _rejected, _finished, error_msg) = backend.get_run_row(run_id).unwrap();
        assert_eq!(status, "failed");
        assert_eq!(
            error_msg,
            Some("[resource] OPEN_FAILED: permission denied".into())
        );
    }

    #[test]
    fn multiple_runs() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run1 = backend.start_run(&pid("p")).unwrap();
        let run2 = backend.start_run(&pid("p")).unwrap();
        assert!(run2 > run1);
    }

    #[test]
    fn error_records_insert_and_count() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.start_run(&pid("p")).unwrap();

        let records = vec![
            record("eval", "REGEX001", Some("amount")),
            record("write", "SFO001", None),
        ];
        let count = backend
            .insert_error_records(&pid("p"), run_id, &records)
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(backend.count_error_records_for_run(&pid("p"), run_id).unwrap(), 2);

        let (step, code, field) = backend.first_error_record(&pid("p")).unwrap();
        assert_eq!(step, "eval");
        assert_eq!(code, "REGEX001");
        assert_eq!(field.as_deref(), Some("amount"));
    }

    #[test]
    fn error_records_empty_insert() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert_eq!(backend.insert_error_records(&pid("p"), 1, &[]).unwrap(), 0);
    }

    #[test]
    fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let backend = SqliteStateBackend::open(&path).unwrap();
        backend.start_run(&pid("p")).unwrap();
        assert!(path.exists());
    }
}
