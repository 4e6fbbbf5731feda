//! A single on-demand rescan of one build.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::pool::CancelToken;
use crate::error::Result;
use crate::model::BuildRef;
use crate::scan::BuildFailureScanner;

/// Per-build mutual exclusion so two rescans of the same build never
/// interleave their remove and attach steps.
#[derive(Default)]
pub struct BuildLocks {
    locks: Mutex<HashMap<BuildRef, Arc<Mutex<()>>>>,
}

impl BuildLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `build`.
    pub fn with_lock<T>(&self, build: &BuildRef, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(build.clone()).or_default())
        };
        let out = {
            let _held = lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        // Only the map's own handle left: nobody holds or waits on it.
        if map.get(build).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(build);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Rescanned { causes: usize },
    Cancelled,
}

pub struct ScanTask {
    build: BuildRef,
    scanner: Arc<BuildFailureScanner>,
    locks: Arc<BuildLocks>,
}

impl ScanTask {
    pub fn new(build: BuildRef, scanner: Arc<BuildFailureScanner>, locks: Arc<BuildLocks>) -> Self {
        Self { build, scanner, locks }
    }

    pub fn build(&self) -> &BuildRef {
        &self.build
    }

    /// Drop the build's found causes and scan it again.  Cancellation is
    /// checked once the lock is held; a started rescan runs to completion.
    pub fn run(&self, cancel: &CancelToken) -> Result<TaskOutcome> {
        self.locks.with_lock(&self.build, || {
            if cancel.is_cancelled() {
                debug!(build = %self.build, "scan task cancelled before start");
                return Ok(TaskOutcome::Cancelled);
            }
            let found = self.scanner.rescan(&self.build)?;
            info!(build = %self.build, causes = found.len(), "on-demand rescan finished");
            Ok(TaskOutcome::Rescanned { causes: found.len() })
        })
    }
}
