use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::info;

use super::converter::FoundIndicationConverter;
use crate::model::BuildRef;

#[derive(Default)]
struct State {
    loaded: bool,
    queued: Vec<BuildRef>,
}

/// Holds conversion requests until [`on_loaded`](Self::on_loaded), then
/// releases them one by one, `stagger` apart.
pub struct DeferredConverter {
    converter: Arc<FoundIndicationConverter>,
    stagger: Duration,
    state: Mutex<State>,
    loaded: Condvar,
}

impl DeferredConverter {
    pub fn new(converter: Arc<FoundIndicationConverter>, stagger: Duration) -> Self {
        Self {
            converter,
            stagger,
            state: Mutex::new(State::default()),
            loaded: Condvar::new(),
        }
    }

    pub fn converter(&self) -> &Arc<FoundIndicationConverter> {
        &self.converter
    }

    /// Convert now if loading has finished, otherwise queue.
    pub fn convert(&self, build: BuildRef) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.loaded {
            drop(st);
            self.converter.convert(build);
        } else if !st.queued.contains(&build) {
            st.queued.push(build);
        }
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).queued.len()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).loaded
    }

    /// Mark loading finished and schedule everything queued so far.  Later
    /// calls are no-ops.
    pub fn on_loaded(&self) {
        let queued = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.loaded {
                return;
            }
            st.loaded = true;
            std::mem::take(&mut st.queued)
        };
        self.loaded.notify_all();
        info!(builds = queued.len(), "releasing deferred conversions");
        for (i, build) in queued.into_iter().enumerate() {
            let offset = self.stagger.saturating_mul(u32::try_from(i).unwrap_or(u32::MAX));
            self.converter.convert_after(build, offset);
        }
    }

    /// Block until loading finished and every scheduled conversion ran, or
    /// `timeout` elapsed.  Returns whether both happened.
    pub fn wait_for_initial_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            while !st.loaded {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (guard, _) = self
                    .loaded
                    .wait_timeout(st, deadline - now)
                    .unwrap_or_else(|e| e.into_inner());
                st = guard;
            }
        }
        self.converter
            .pool()
            .wait_idle(deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationConfig;
    use crate::migrate::MigrationPool;
    use crate::model::{
        BuildInfo, BuildResult, BuildStore, FailureCause, FoundFailureCause, FoundIndication, InMemoryBuildStore,
    };
    use std::thread;

    fn setup(n: u64) -> (DeferredConverter, Arc<InMemoryBuildStore>, Vec<BuildRef>) {
        let store = Arc::new(InMemoryBuildStore::new());
        let cause = FailureCause::new("c", "").with_id("c1");
        let mut refs = Vec::new();
        for i in 1..=n {
            let b = BuildRef::new("old", i);
            store.insert(BuildInfo::new(b.clone(), BuildResult::Failure), vec![format!("line of build {i}")]);
            store
                .attach_found_causes(&b, vec![FoundFailureCause::new(&cause, vec![FoundIndication::legacy("x", "log", 1)])])
                .unwrap();
            refs.push(b);
        }
        let pool = Arc::new(
            MigrationPool::new(&MigrationConfig {
                pool_size: 2,
                ..MigrationConfig::default()
            })
            .unwrap(),
        );
        let conv = Arc::new(FoundIndicationConverter::new(pool, store.clone(), Duration::from_millis(5)));
        (DeferredConverter::new(conv, Duration::from_millis(2)), store, refs)
    }

    fn converted(store: &InMemoryBuildStore, b: &BuildRef) -> bool {
        store.found_causes(b).unwrap().unwrap()[0].indications[0].matching_string.is_some()
    }

    #[test]
    fn requests_wait_for_loaded_signal() {
        let (d, store, refs) = setup(3);
        for b in &refs {
            d.convert(b.clone());
        }
        d.convert(refs[0].clone());
        assert_eq!(d.queued(), 3);
        thread::sleep(Duration::from_millis(30));
        assert!(refs.iter().all(|b| !converted(&store, b)));

        d.on_loaded();
        assert!(d.wait_for_initial_completion(Duration::from_secs(5)));
        assert!(refs.iter().all(|b| converted(&store, b)));
        assert_eq!(d.converter().converted_count(), 3);
    }

    #[test]
    fn after_loaded_requests_go_straight_through() {
        let (d, store, refs) = setup(1);
        d.on_loaded();
        d.on_loaded();
        d.convert(refs[0].clone());
        assert_eq!(d.queued(), 0);
        assert!(d.wait_for_initial_completion(Duration::from_secs(5)));
        assert!(converted(&store, &refs[0]));
    }

    #[test]
    fn wait_times_out_before_loaded() {
        let (d, _, _) = setup(0);
        assert!(!d.is_loaded());
        assert!(!d.wait_for_initial_completion(Duration::from_millis(20)));
    }
}
