//! # Stage: Knowledge Base Cache
//!
//! ## Responsibility
//! Keep an in-memory copy of the live cause list and the category list of a
//! remote knowledge base, refreshed by one background updater thread, so
//! reads never wait on the network.
//!
//! The updater loop: fetch both lists, swap them in as a new
//! [`CacheSnapshot`], wait for the refresh interval (or an explicit
//! [`KnowledgeBaseCache::update_cache`] signal), repeat until stopped.
//!
//! ## Guarantees
//! - Readers see a whole snapshot or the previous one, never a mix
//! - The first read before any refresh performs one synchronous fetch, so
//!   callers never see a false empty catalog
//! - A failed refresh is logged and retried next interval; the last good
//!   snapshot keeps serving
//! - Refresh signals that pile up while a refresh runs collapse into one
//! - `stop()` joins the updater; `is_running()` is false afterwards and the
//!   last snapshot remains readable
//!
//! ## NOT Responsible For
//! - Write-through (see `CachedKnowledgeBase`)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::KnowledgeBase;
use crate::error::Result;
use crate::model::FailureCause;

/// Consecutive refresh failures after which logging escalates to `error!`.
const ESCALATE_AFTER: u32 = 5;

// ---------------------------------------------------------------------------
// CacheSnapshot
// ---------------------------------------------------------------------------

/// Immutable point-in-time copy of the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
    pub causes: Vec<FailureCause>,
    pub categories: Vec<String>,
    pub fetched_at: Instant,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    backend: Arc<dyn KnowledgeBase>,
    snapshot: RwLock<Option<Arc<CacheSnapshot>>>,
    refreshes: AtomicU64,
    failed_refreshes: AtomicU64,
}

impl Shared {
    fn fetch(&self) -> Result<Arc<CacheSnapshot>> {
        let causes = self.backend.get_causes()?;
        let categories = self.backend.get_categories()?;
        let snap = Arc::new(CacheSnapshot {
            causes,
            categories,
            fetched_at: Instant::now(),
        });
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&snap));
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(snap)
    }

    fn current(&self) -> Option<Arc<CacheSnapshot>> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

enum Signal {
    Refresh,
    Stop,
}

struct Updater {
    signals: mpsc::Sender<Signal>,
    handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// KnowledgeBaseCache
// ---------------------------------------------------------------------------

pub struct KnowledgeBaseCache {
    shared: Arc<Shared>,
    interval: Duration,
    updater: Mutex<Option<Updater>>,
}

impl KnowledgeBaseCache {
    pub fn new(backend: Arc<dyn KnowledgeBase>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                snapshot: RwLock::new(None),
                refreshes: AtomicU64::new(0),
                failed_refreshes: AtomicU64::new(0),
            }),
            interval,
            updater: Mutex::new(None),
        }
    }

    /// Spawn the updater thread.  A second call while running is a no-op.
    pub fn start(&self) {
        let mut slot = self.updater.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("bfa-kb-cache".into())
            .spawn(move || run_updater(shared, rx, interval));
        match spawned {
            Ok(handle) => {
                info!(
                    backend = self.shared.backend.backend_name(),
                    interval_secs = interval.as_secs(),
                    "knowledge base cache started"
                );
                *slot = Some(Updater { signals: tx, handle });
            }
            Err(e) => error!(error = %e, "failed to spawn knowledge base cache updater"),
        }
    }

    /// Signal the updater to exit and wait for it.
    pub fn stop(&self) {
        let updater = self.updater.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(u) = updater {
            let _ = u.signals.send(Signal::Stop);
            if u.handle.join().is_err() {
                error!("knowledge base cache updater panicked");
            }
            info!(
                backend = self.shared.backend.backend_name(),
                "knowledge base cache stopped"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.updater.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Ask the updater for an immediate refresh.  Without a running updater
    /// the next read fetches synchronously only if nothing was cached yet.
    pub fn update_cache(&self) {
        let guard = self.updater.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(u) = guard.as_ref() {
            let _ = u.signals.send(Signal::Refresh);
        }
    }

    /// The latest snapshot, fetching synchronously on a cold cache.
    pub fn snapshot(&self) -> Result<Arc<CacheSnapshot>> {
        match self.shared.current() {
            Some(snap) => Ok(snap),
            None => {
                debug!("knowledge base cache cold, fetching synchronously");
                self.shared.fetch()
            }
        }
    }

    pub fn get_causes(&self) -> Result<Vec<FailureCause>> {
        Ok(self.snapshot()?.causes.clone())
    }

    pub fn get_categories(&self) -> Result<Vec<String>> {
        Ok(self.snapshot()?.categories.clone())
    }

    /// Number of successful refreshes so far.
    pub fn refresh_count(&self) -> u64 {
        self.shared.refreshes.load(Ordering::Relaxed)
    }

    /// Background refreshes that failed and left the snapshot as it was.
    pub fn failed_refresh_count(&self) -> u64 {
        self.shared.failed_refreshes.load(Ordering::Relaxed)
    }
}

impl Drop for KnowledgeBaseCache {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_updater(shared: Arc<Shared>, signals: mpsc::Receiver<Signal>, interval: Duration) {
    let mut consecutive_failures: u32 = 0;
    loop {
        match shared.fetch() {
            Ok(snap) => {
                consecutive_failures = 0;
                debug!(causes = snap.causes.len(), "knowledge base cache refreshed");
            }
            Err(e) => {
                shared.failed_refreshes.fetch_add(1, Ordering::Relaxed);
                consecutive_failures = consecutive_failures.saturating_add(1);
                if consecutive_failures >= ESCALATE_AFTER {
                    error!(
                        error = %e,
                        backend = shared.backend.backend_name(),
                        consecutive_failures,
                        "cache refresh failed repeatedly, will retry next interval"
                    );
                } else {
                    warn!(
                        error = %e,
                        backend = shared.backend.backend_name(),
                        "cache refresh failed, will retry next interval"
                    );
                }
            }
        }

        match signals.recv_timeout(interval) {
            Ok(Signal::Refresh) => {
                // Collapse queued refresh requests into this one.
                loop {
                    match signals.try_recv() {
                        Ok(Signal::Refresh) => continue,
                        Ok(Signal::Stop) | Err(mpsc::TryRecvError::Disconnected) => return,
                        Err(mpsc::TryRecvError::Empty) => break,
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
