//! The progress-observer seam.
//!
//! Per the "cyclic references between scheduler and progress reporter"
//! design note: the scheduler never reaches back into a concrete reporter.
//! It only ever calls through this thin trait, injected at construction
//! time. [`crate::progress`] provides the terminal-facing implementation.

use std::fmt;

/// Identifies a unit of work for observer callbacks: a phase tag plus a
/// human-readable job name (usually an artifact's full name).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct JobLabel {
    pub phase: String,
    pub name: String,
}

impl fmt::Display for JobLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.phase, self.name)
    }
}

/// Observer callbacks the scheduler invokes as jobs move through their
/// lifecycle. Implementations must not block significantly; slow rendering
/// work should hop to its own task.
pub trait SchedulerObserver: Send + Sync {
    fn on_enqueue(&self, _job: &JobLabel) {}
    fn on_start(&self, _job: &JobLabel) {}
    fn on_progress(&self, _job: &JobLabel, _bytes: u64, _total: Option<u64>) {}
    fn on_complete(&self, _job: &JobLabel) {}
    fn on_fail(&self, _job: &JobLabel, _message: &str) {}
}

/// An observer that discards every event; used by tests and non-interactive
/// invocations of the core library that don't want terminal output.
pub struct NullObserver;

impl SchedulerObserver for NullObserver {}
