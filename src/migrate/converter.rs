use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::MigrationPool;
use crate::error::Result;
use crate::model::{BuildRef, BuildStore};
use crate::sod::BuildLocks;

/// Fills `matching_string` into found indications that only carry a line
/// number.  Each build is converted at most once per converter.
///
/// Conversion rewrites the build's found causes, so it runs under the same
/// [`BuildLocks`] as on-demand rescans; share them with
/// [`with_locks`](Self::with_locks).
pub struct FoundIndicationConverter {
    pool: Arc<MigrationPool>,
    builds: Arc<dyn BuildStore>,
    locks: Arc<BuildLocks>,
    debounce: Duration,
    seen: Arc<Mutex<HashSet<BuildRef>>>,
    converted: Arc<AtomicU64>,
}

impl FoundIndicationConverter {
    pub fn new(pool: Arc<MigrationPool>, builds: Arc<dyn BuildStore>, debounce: Duration) -> Self {
        Self {
            pool,
            builds,
            locks: Arc::new(BuildLocks::new()),
            debounce,
            seen: Arc::new(Mutex::new(HashSet::new())),
            converted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_locks(mut self, locks: Arc<BuildLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn pool(&self) -> &Arc<MigrationPool> {
        &self.pool
    }

    /// Schedule conversion of `build` after the debounce delay.  Returns
    /// `false` when the build was already scheduled or converted.
    pub fn convert(&self, build: BuildRef) -> bool {
        self.convert_after(build, Duration::ZERO)
    }

    pub(crate) fn convert_after(&self, build: BuildRef, extra: Duration) -> bool {
        let first = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(build.clone());
        if !first {
            debug!(build = %build, "conversion already scheduled");
            return false;
        }
        let builds = Arc::clone(&self.builds);
        let locks = Arc::clone(&self.locks);
        let converted = Arc::clone(&self.converted);
        self.pool.schedule(self.debounce + extra, move || {
            match convert_build_locked(builds.as_ref(), &locks, &build) {
                Ok(0) => debug!(build = %build, "nothing to convert"),
                Ok(n) => {
                    converted.fetch_add(1, Ordering::Relaxed);
                    info!(build = %build, indications = n, "converted legacy found indications");
                }
                Err(e) => warn!(error = %e, build = %build, "found indication conversion failed"),
            }
        });
        true
    }

    /// Builds whose records were actually rewritten.
    pub fn converted_count(&self) -> u64 {
        self.converted.load(Ordering::Relaxed)
    }
}

/// Convert one build in place.  Returns how many indications changed; the
/// build is only saved again when that is non-zero.
pub fn convert_build(builds: &dyn BuildStore, build: &BuildRef) -> Result<usize> {
    let Some(mut causes) = builds.found_causes(build)? else {
        return Ok(0);
    };
    if !causes.iter().flat_map(|c| &c.indications).any(|i| i.needs_conversion()) {
        return Ok(0);
    }
    let log = builds.log_lines(build)?;
    let mut changed = 0;
    for ind in causes.iter_mut().flat_map(|c| c.indications.iter_mut()) {
        if ind.convert_from_line_number(&log) {
            changed += 1;
        }
    }
    if changed > 0 {
        builds.attach_found_causes(build, causes)?;
    }
    Ok(changed)
}

/// [`convert_build`] under the build's lock.  The found causes are read
/// only once the lock is held, so a rescan finishing first is never
/// overwritten with the legacy records.
pub fn convert_build_locked(builds: &dyn BuildStore, locks: &BuildLocks, build: &BuildRef) -> Result<usize> {
    locks.with_lock(build, || convert_build(builds, build))
}
