//! Outcome counters shared by the scheduled sweeps

/// Per-run counters of a sweep
///
/// Sweeps isolate failures per item: a failing item is counted and logged,
/// and the run continues with the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub changed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.examined += other.examined;
        self.changed += other.changed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}
