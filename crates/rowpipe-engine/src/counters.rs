//! Instance-scoped row counters.
//!
//! Only the owning instance increments; other tasks read through
//! [`TransformCounters::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use rowpipe_types::metric::CounterSnapshot;

#[derive(Debug, Default)]
pub struct TransformCounters {
    lines_read: AtomicU64,
    lines_written: AtomicU64,
    lines_input: AtomicU64,
    lines_output: AtomicU64,
    lines_rejected: AtomicU64,
    errors: AtomicU64,
}

impl TransformCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_lines_read(&self) {
        self.lines_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lines_written(&self) {
        self.lines_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lines_input(&self) {
        self.lines_input.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lines_output(&self) {
        self.lines_output.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lines_rejected(&self) {
        self.lines_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read.load(Ordering::Relaxed)
    }

    pub fn lines_input(&self) -> u64 {
        self.lines_input.load(Ordering::Relaxed)
    }

    pub fn lines_output(&self) -> u64 {
        self.lines_output.load(Ordering::Relaxed)
    }

    pub fn lines_rejected(&self) -> u64 {
        self.lines_rejected.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            lines_read: self.lines_read(),
            lines_written: self.lines_written.load(Ordering::Relaxed),
            lines_input: self.lines_input(),
            lines_output: self.lines_output(),
            lines_rejected: self.lines_rejected(),
            errors: self.errors(),
        }
    }
}
