//! # Stage: Background Migration
//!
//! ## Responsibility
//! Convert legacy persisted records in the background without blocking
//! startup.  [`MigrationPool`] owns the delayed-job runtime;
//! [`FoundIndicationConverter`] fills matched content into old found
//! indications; [`DeferredConverter`] holds requests back until the host
//! reports it has finished loading.
//!
//! ## Guarantees
//! - Every job runs after its delay on the runtime's blocking pool
//! - [`MigrationPool::wait_idle`] returns once no job is pending
//!
//! ## NOT Responsible For
//! - Schema migrations of the knowledge base (see `kb::sqlite`)

pub mod converter;
pub mod deferred;

pub use converter::{convert_build, convert_build_locked, FoundIndicationConverter};
pub use deferred::DeferredConverter;

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Runtime};
use tracing::{error, info, warn};

use crate::config::MigrationConfig;
use crate::error::{Error, Result};

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Decrements the pending count when the job ends, however it ends.
struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut n = self.0.count.lock().unwrap_or_else(|e| e.into_inner());
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub struct MigrationPool {
    runtime: Mutex<Option<Runtime>>,
    pending: Arc<Pending>,
}

impl MigrationPool {
    pub fn new(cfg: &MigrationConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(cfg.pool_size.max(1))
            .thread_name("bfa-migration")
            .enable_time()
            .build()
            .map_err(|source| Error::Runtime {
                what: "migration runtime",
                source,
            })?;
        info!(workers = cfg.pool_size.max(1), "migration pool started");
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            pending: Arc::new(Pending::default()),
        })
    }

    /// Run `job` on the blocking pool once `delay` has elapsed.  Jobs
    /// scheduled after [`shutdown`](Self::shutdown) are dropped.
    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let Some(rt) = runtime.as_ref() else {
            warn!("migration pool stopped, job dropped");
            return;
        };
        *self.pending.count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        let guard = PendingGuard(Arc::clone(&self.pending));
        rt.spawn(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                error!(error = %e, "migration job failed");
            }
        });
    }

    pub fn pending(&self) -> usize {
        *self.pending.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until no job is pending or `timeout` elapses.  Returns whether
    /// the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut n = self.pending.count.lock().unwrap_or_else(|e| e.into_inner());
        while *n > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .pending
                .idle
                .wait_timeout(n, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            n = guard;
        }
        true
    }

    /// Stop the runtime, giving running jobs up to `timeout`.  Jobs still
    /// waiting for their delay are discarded.
    pub fn shutdown(&self, timeout: Duration) {
        let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(rt) = runtime {
            rt.shutdown_timeout(timeout);
            info!("migration pool stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> MigrationPool {
        MigrationPool::new(&MigrationConfig {
            pool_size: 2,
            ..MigrationConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn scheduled_jobs_run_after_delay() {
        let pool = pool();
        let ran = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        for _ in 0..3 {
            let r = Arc::clone(&ran);
            pool.schedule(Duration::from_millis(30), move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(pool.pending(), 0);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn panicking_job_still_clears_pending() {
        let pool = pool();
        pool.schedule(Duration::ZERO, || panic!("bad record"));
        assert!(pool.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn schedule_after_shutdown_is_dropped() {
        let pool = pool();
        pool.shutdown(Duration::from_millis(10));
        assert!(!pool.is_running());
        pool.schedule(Duration::ZERO, || {});
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn wait_idle_times_out_while_jobs_pending() {
        let pool = pool();
        pool.schedule(Duration::from_secs(30), || {});
        assert!(!pool.wait_idle(Duration::from_millis(20)));
        pool.shutdown(Duration::from_millis(10));
    }
}
