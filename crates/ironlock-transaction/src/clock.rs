//! Global logical clock

use ironlock_common::Timestamp;

/// Monotonic counter ordering every transaction event of a database.
///
/// Owned by the coordinator and only advanced while its write lock is held.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: Timestamp,
}

impl LogicalClock {
    /// Create a clock whose next timestamp follows `start`
    pub fn new(start: Timestamp) -> Self {
        LogicalClock { value: start }
    }

    /// Advance and return the new timestamp
    pub fn next(&mut self) -> Timestamp {
        self.value += 1;
        self.value
    }

    /// The last timestamp handed out
    pub fn current(&self) -> Timestamp {
        self.value
    }
}
