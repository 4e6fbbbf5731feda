//! A [`KnowledgeBase`] that serves listings from a [`KnowledgeBaseCache`]
//! and writes through to the wrapped backend.

use std::sync::Arc;
use std::time::Duration;

use super::cache::KnowledgeBaseCache;
use super::KnowledgeBase;
use crate::error::Result;
use crate::model::{FailureCause, Statistics, StatisticsFilter};

pub struct CachedKnowledgeBase {
    backend: Arc<dyn KnowledgeBase>,
    cache: KnowledgeBaseCache,
}

impl CachedKnowledgeBase {
    pub fn new(backend: Arc<dyn KnowledgeBase>, refresh_interval: Duration) -> Self {
        let cache = KnowledgeBaseCache::new(Arc::clone(&backend), refresh_interval);
        Self { backend, cache }
    }

    pub fn cache(&self) -> &KnowledgeBaseCache {
        &self.cache
    }
}

impl KnowledgeBase for CachedKnowledgeBase {
    fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    fn start(&self) -> Result<()> {
        self.backend.start()?;
        self.cache.start();
        Ok(())
    }

    fn stop(&self) {
        self.cache.stop();
        self.backend.stop();
    }

    fn get_cause(&self, id: &str) -> Result<Option<FailureCause>> {
        self.backend.get_cause(id)
    }

    fn get_causes(&self) -> Result<Vec<FailureCause>> {
        self.cache.get_causes()
    }

    fn add_cause(&self, cause: FailureCause) -> Result<FailureCause> {
        let out = self.backend.add_cause(cause)?;
        self.cache.update_cache();
        Ok(out)
    }

    fn save_cause(&self, cause: FailureCause) -> Result<FailureCause> {
        let out = self.backend.save_cause(cause)?;
        self.cache.update_cache();
        Ok(out)
    }

    fn remove_cause(&self, id: &str, removed_by: &str) -> Result<Option<FailureCause>> {
        let out = self.backend.remove_cause(id, removed_by)?;
        self.cache.update_cache();
        Ok(out)
    }

    fn get_categories(&self) -> Result<Vec<String>> {
        self.cache.get_categories()
    }

    fn is_statistics_enabled(&self) -> bool {
        self.backend.is_statistics_enabled()
    }

    fn is_successful_logging_enabled(&self) -> bool {
        self.backend.is_successful_logging_enabled()
    }

    fn save_statistics(&self, stat: &Statistics) -> Result<()> {
        self.backend.save_statistics(stat)
    }

    fn get_statistics(&self, filter: &StatisticsFilter, limit: Option<usize>) -> Result<Vec<Statistics>> {
        self.backend.get_statistics(filter, limit)
    }

    fn update_last_seen(&self, ids: &[String], time: u64) -> Result<()> {
        self.backend.update_last_seen(ids, time)?;
        self.cache.update_cache();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::document::memory::MemoryDriver;
    use crate::kb::DocumentKnowledgeBase;
    use std::time::Instant;

    fn cached() -> CachedKnowledgeBase {
        let backend = Arc::new(DocumentKnowledgeBase::new(MemoryDriver::default(), true, false));
        CachedKnowledgeBase::new(backend, Duration::from_secs(3600))
    }

    fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn writes_become_visible_through_refresh() {
        let kb = cached();
        kb.start().unwrap();
        assert!(eventually(|| kb.cache().refresh_count() >= 1));
        let c = kb.add_cause(FailureCause::new("a", "").with_category("x")).unwrap();
        assert!(eventually(|| kb.get_causes().unwrap().len() == 1));
        assert_eq!(kb.get_categories().unwrap(), vec!["x".to_string()]);
        kb.remove_cause(&c.id, "ops").unwrap();
        assert!(eventually(|| kb.get_causes().unwrap().is_empty()));
        kb.stop();
        assert!(!kb.cache().is_running());
    }

    #[test]
    fn get_cause_bypasses_cache() {
        let kb = cached();
        let c = kb.add_cause(FailureCause::new("a", "")).unwrap();
        kb.remove_cause(&c.id, "ops").unwrap();
        assert!(kb.get_cause(&c.id).unwrap().unwrap().is_removed());
    }

    #[test]
    fn statistics_delegate_to_backend() {
        let kb = cached();
        assert!(kb.is_statistics_enabled());
        assert_eq!(kb.backend_name(), "memory");
    }
}
