//! Explicit per-cycle context.
//!
//! The cycle number travels as a value handed to whoever needs it -- never
//! as hidden task-local state that could leak between orchestrator
//! instances in one process.

use chrono::{DateTime, Utc};

/// Identity of the cycle currently executing. Created at step 1 of the
/// driver loop, dropped when the cycle ends.
#[derive(Debug, Clone, Copy)]
pub struct CycleContext {
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
}

impl CycleContext {
    /// The cycle number as stored in log records.
    pub fn cycle_i64(&self) -> i64 {
        self.cycle_number as i64
    }
}
