//! # Stage: Resizable Worker Pool
//!
//! ## Responsibility
//! Run submitted tasks on a bounded set of worker threads with a bounded
//! queue.  Sizing (`min`/`max` workers, keep-alive, queue capacity) can be
//! changed while the pool runs.
//!
//! Admission order for a new task:
//! 1. an idle worker is waiting: enqueue it for that worker
//! 2. fewer than `max` workers: spawn one and hand it the task directly
//! 3. queue below capacity: enqueue
//! 4. otherwise reject with `RejectedTask::Saturated`
//!
//! ## Guarantees
//! - Never blocks the submitter
//! - Workers above `min` exit after `keep_alive` without work; lowering
//!   `max` retires surplus workers as they go idle
//! - A panicking task is logged and does not take its worker down
//! - `shutdown` drops queued tasks, waits up to the grace period for running
//!   ones, then raises the cooperative [`CancelToken`]
//!
//! ## NOT Responsible For
//! - Forcibly stopping a running task (threads cannot be killed)

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::ScanOnDemandConfig;
use crate::error::RejectedTask;

pub type Task = Box<dyn FnOnce(&CancelToken) + Send + 'static>;

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared by every task of a pool.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// ShutdownReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Queued tasks dropped without running.
    pub dropped: usize,
    /// Tasks still running when the grace period ended.
    pub stragglers: usize,
}

impl ShutdownReport {
    pub fn terminated(&self) -> bool {
        self.stragglers == 0
    }
}

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

struct State {
    queue: VecDeque<Task>,
    workers: usize,
    idle: usize,
    active: usize,
    min_workers: usize,
    max_workers: usize,
    capacity: usize,
    keep_alive: Duration,
    shutdown: bool,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    work_ready: Condvar,
    drained: Condvar,
    cancel: CancelToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct WorkerPool {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, cfg: &ScanOnDemandConfig) -> Self {
        let cfg = cfg.clamped();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    active: 0,
                    min_workers: cfg.min_workers,
                    max_workers: cfg.max_workers,
                    capacity: cfg.queue_capacity,
                    keep_alive: cfg.keep_alive(),
                    shutdown: false,
                }),
                work_ready: Condvar::new(),
                drained: Condvar::new(),
                cancel: CancelToken::default(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn submit(&self, task: Task) -> Result<(), RejectedTask> {
        let mut st = self.inner.lock();
        if st.shutdown {
            return Err(RejectedTask::ShutDown);
        }
        if st.idle > st.queue.len() {
            st.queue.push_back(task);
            self.inner.work_ready.notify_one();
            return Ok(());
        }
        if st.workers < st.max_workers {
            st.workers += 1;
            st.active += 1;
            drop(st);
            return self.spawn_worker(Some(task));
        }
        if st.queue.len() < st.capacity {
            st.queue.push_back(task);
            self.inner.work_ready.notify_one();
            return Ok(());
        }
        Err(RejectedTask::Saturated {
            workers: st.workers,
            queued: st.queue.len(),
        })
    }

    /// Start a worker whose slot (and, with `first`, active count) has
    /// already been reserved.
    fn spawn_worker(&self, first: Option<Task>) -> Result<(), RejectedTask> {
        let inner = Arc::clone(&self.inner);
        let had_first = first.is_some();
        let spawned = thread::Builder::new()
            .name(format!("{}-worker", self.inner.name))
            .spawn(move || worker_loop(inner, first));
        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                error!(pool = %self.inner.name, error = %e, "failed to spawn worker");
                let mut st = self.inner.lock();
                st.workers -= 1;
                if had_first {
                    st.active -= 1;
                }
                Err(RejectedTask::Saturated {
                    workers: st.workers,
                    queued: st.queue.len(),
                })
            }
        }
    }

    /// Apply new sizing.  Surplus idle workers retire; queued work gets new
    /// workers if the maximum grew.
    pub fn reconfigure(&self, cfg: &ScanOnDemandConfig) {
        let cfg = cfg.clamped();
        let spawn = {
            let mut st = self.inner.lock();
            st.min_workers = cfg.min_workers;
            st.max_workers = cfg.max_workers;
            st.capacity = cfg.queue_capacity;
            st.keep_alive = cfg.keep_alive();
            let wanted = st.queue.len().saturating_sub(st.idle);
            let room = st.max_workers.saturating_sub(st.workers);
            let n = if st.shutdown { 0 } else { wanted.min(room) };
            st.workers += n;
            n
        };
        self.inner.work_ready.notify_all();
        for _ in 0..spawn {
            let _ = self.spawn_worker(None);
        }
        info!(
            pool = %self.inner.name,
            min_workers = cfg.min_workers,
            max_workers = cfg.max_workers,
            queue_capacity = cfg.queue_capacity,
            "pool reconfigured"
        );
    }

    pub fn queue_size(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    /// Stop accepting work, drop queued tasks, wait up to `grace` for
    /// running tasks, then cancel the stragglers.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let deadline = Instant::now() + grace;
        let mut st = self.inner.lock();
        st.shutdown = true;
        let dropped = st.queue.len();
        st.queue.clear();
        self.inner.work_ready.notify_all();

        while st.active > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .inner
                .drained
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
        let stragglers = st.active;
        drop(st);

        if stragglers > 0 {
            self.inner.cancel.cancel();
            warn!(
                pool = %self.inner.name,
                stragglers,
                grace_ms = grace.as_millis() as u64,
                "pool did not terminate within grace period, cancelling running tasks"
            );
        } else {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            for h in handles.drain(..) {
                let _ = h.join();
            }
        }
        info!(pool = %self.inner.name, dropped, stragglers, "pool shut down");
        ShutdownReport { dropped, stragglers }
    }
}

impl Drop for WorkerPool {
    /// Release parked workers without waiting for running tasks.
    fn drop(&mut self) {
        let mut st = self.inner.lock();
        if !st.shutdown {
            st.shutdown = true;
            st.queue.clear();
            self.inner.work_ready.notify_all();
        }
    }
}

fn worker_loop(inner: Arc<Inner>, mut next: Option<Task>) {
    loop {
        if let Some(task) = next.take() {
            if catch_unwind(AssertUnwindSafe(|| task(&inner.cancel))).is_err() {
                error!(pool = %inner.name, "task panicked");
            }
            let mut st = inner.lock();
            st.active -= 1;
            if st.active == 0 {
                inner.drained.notify_all();
            }
        }

        let mut st = inner.lock();
        loop {
            if let Some(task) = st.queue.pop_front() {
                st.active += 1;
                next = Some(task);
                break;
            }
            if st.shutdown || st.workers > st.max_workers {
                st.workers -= 1;
                debug!(pool = %inner.name, workers = st.workers, "worker exiting");
                return;
            }
            st.idle += 1;
            if st.workers > st.min_workers {
                let keep_alive = st.keep_alive;
                let (guard, timeout) = inner
                    .work_ready
                    .wait_timeout(st, keep_alive)
                    .unwrap_or_else(|e| e.into_inner());
                st = guard;
                st.idle -= 1;
                if timeout.timed_out() && st.queue.is_empty() && st.workers > st.min_workers {
                    st.workers -= 1;
                    debug!(pool = %inner.name, workers = st.workers, "idle worker retired after keep-alive");
                    return;
                }
            } else {
                st = inner.work_ready.wait(st).unwrap_or_else(|e| e.into_inner());
                st.idle -= 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
