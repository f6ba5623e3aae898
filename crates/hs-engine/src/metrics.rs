//! Bookkeeping counters of the controllers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ControllerMetrics {
    experiments_created: AtomicU64,
    experiments_succeeded: AtomicU64,
    experiments_failed: AtomicU64,
    experiments_deleted: AtomicU64,
    experiments_restarted: AtomicU64,
    trials_created: AtomicU64,
    trials_deleted: AtomicU64,
}

/// Point-in-time copy of [`ControllerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub experiments_created: u64,
    pub experiments_succeeded: u64,
    pub experiments_failed: u64,
    pub experiments_deleted: u64,
    pub experiments_restarted: u64,
    pub trials_created: u64,
    pub trials_deleted: u64,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn experiment_created(&self) {
        self.experiments_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn experiment_succeeded(&self) {
        self.experiments_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn experiment_failed(&self) {
        self.experiments_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn experiment_deleted(&self) {
        self.experiments_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn experiment_restarted(&self) {
        self.experiments_restarted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trial_created(&self) {
        self.trials_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trials_deleted(&self, count: u64) {
        self.trials_deleted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            experiments_created: self.experiments_created.load(Ordering::Relaxed),
            experiments_succeeded: self.experiments_succeeded.load(Ordering::Relaxed),
            experiments_failed: self.experiments_failed.load(Ordering::Relaxed),
            experiments_deleted: self.experiments_deleted.load(Ordering::Relaxed),
            experiments_restarted: self.experiments_restarted.load(Ordering::Relaxed),
            trials_created: self.trials_created.load(Ordering::Relaxed),
            trials_deleted: self.trials_deleted.load(Ordering::Relaxed),
        }
    }
}
