use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::pool::{CancelToken, ShutdownReport, WorkerPool};
use super::task::{BuildLocks, ScanTask};
use crate::config::ScanOnDemandConfig;
use crate::error::RejectedTask;
use crate::model::BuildRef;
use crate::scan::BuildFailureScanner;

/// Accepts rescan requests and runs them on a [`WorkerPool`].
pub struct ScanOnDemandQueue {
    pool: WorkerPool,
    scanner: Arc<BuildFailureScanner>,
    locks: Arc<BuildLocks>,
}

impl ScanOnDemandQueue {
    pub fn new(cfg: &ScanOnDemandConfig, scanner: Arc<BuildFailureScanner>) -> Self {
        Self::with_locks(cfg, scanner, Arc::new(BuildLocks::new()))
    }

    /// Rescans take `locks` per build; pass the set other writers of found
    /// causes use.
    pub fn with_locks(cfg: &ScanOnDemandConfig, scanner: Arc<BuildFailureScanner>, locks: Arc<BuildLocks>) -> Self {
        Self {
            pool: WorkerPool::new("bfa-sod", cfg),
            scanner,
            locks,
        }
    }

    pub fn locks(&self) -> &Arc<BuildLocks> {
        &self.locks
    }

    /// Submit a rescan of `build`.  A rejected request is logged and
    /// dropped; the return value says whether it was accepted.
    pub fn queue(&self, build: BuildRef) -> bool {
        let task = ScanTask::new(build.clone(), Arc::clone(&self.scanner), Arc::clone(&self.locks));
        let submitted = self.pool.submit(Box::new(move |cancel: &CancelToken| {
            if let Err(e) = task.run(cancel) {
                error!(error = %e, build = %task.build(), "on-demand rescan failed");
            }
        }));
        match submitted {
            Ok(()) => true,
            Err(RejectedTask::Saturated { workers, queued }) => {
                warn!(build = %build, workers, queued, "scan-on-demand pool saturated, request dropped");
                false
            }
            Err(RejectedTask::ShutDown) => {
                warn!(build = %build, "scan-on-demand pool shut down, request dropped");
                false
            }
        }
    }

    pub fn queue_size(&self) -> usize {
        self.pool.queue_size()
    }

    pub fn active_count(&self) -> usize {
        self.pool.active_count()
    }

    pub fn reconfigure(&self, cfg: &ScanOnDemandConfig) {
        self.pool.reconfigure(cfg);
    }

    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let report = self.pool.shutdown(grace);
        if !report.terminated() {
            info!(stragglers = report.stragglers, "scan-on-demand rescans still running after shutdown");
        }
        report
    }
}
