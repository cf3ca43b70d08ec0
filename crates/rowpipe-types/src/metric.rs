//! Per-instance row counters as seen by collaborators.

use serde::{Deserialize, Serialize};

/// Point-in-time copy of a transform instance's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Rows pulled from upstream channels.
    pub lines_read: u64,
    /// Rows pushed to downstream channels.
    pub lines_written: u64,
    /// Rows read from an external input (files).
    pub lines_input: u64,
    /// Rows written to an external output (files).
    pub lines_output: u64,
    /// Rows diverted to the error output.
    pub lines_rejected: u64,
    /// Fatal errors and failed resource releases.
    pub errors: u64,
}

impl CounterSnapshot {
    /// Element-wise sum, used to aggregate parallel copies of a step.
    #[must_use]
    pub fn merged(self, other: Self) -> Self {
        Self {
            lines_read: self.lines_read + other.lines_read,
            lines_written: self.lines_written + other.lines_written,
            lines_input: self.lines_input + other.lines_input,
            lines_output: self.lines_output + other.lines_output,
            lines_rejected: self.lines_rejected + other.lines_rejected,
            errors: self.errors + other.errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_sums_each_counter() {
        let a = CounterSnapshot {
            lines_read: 1,
            lines_written: 2,
            lines_input: 3,
            lines_output: 4,
            lines_rejected: 5,
            errors: 6,
        };
        let total = a.merged(a);
        assert_eq!(total.lines_read, 2);
        assert_eq!(total.errors, 12);
        assert_eq!(total.lines_output, 8);
    }
}
