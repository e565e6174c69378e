use crate::jobs::JobStatus;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing job activity since startup.
#[derive(Default)]
pub struct JobMetrics {
    started: AtomicU64,
    coalesced: AtomicU64,
    passed: AtomicU64,
    failed: AtomicU64,
}

impl JobMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly created job.
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a start request that joined an already running job.
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the terminal status of a job.
    pub fn record_finished(&self, status: JobStatus) {
        match status {
            JobStatus::Pass => self.passed.fetch_add(1, Ordering::Relaxed),
            JobStatus::Fail => self.failed.fetch_add(1, Ordering::Relaxed),
            JobStatus::Running => return,
        };
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let started = self.started.load(Ordering::Relaxed);
        let passed = self.passed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        MetricsSnapshot {
            jobs_started: started,
            jobs_coalesced: self.coalesced.load(Ordering::Relaxed),
            jobs_passed: passed,
            jobs_failed: failed,
            jobs_running: started.saturating_sub(passed + failed),
        }
    }
}

/// Immutable view of job counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Jobs created since startup.
    pub jobs_started: u64,
    /// Start requests answered with an already running job.
    pub jobs_coalesced: u64,
    /// Jobs that finished with `pass`.
    pub jobs_passed: u64,
    /// Jobs that finished with `fail`.
    pub jobs_failed: u64,
    /// Jobs started but not yet finished.
    pub jobs_running: u64,
}
