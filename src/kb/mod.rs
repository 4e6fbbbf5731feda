//! # Stage: Knowledge Base
//!
//! ## Responsibility
//! One contract, [`KnowledgeBase`], over every place failure causes and
//! build statistics can live.  Backends:
//!
//! - [`LocalFileKnowledgeBase`]: in-process map, optionally persisted to a
//!   JSON file.  No statistics.
//! - [`DocumentKnowledgeBase`] over a [`DocumentDriver`]: remote document
//!   stores.  Drivers ship for SQLite and (feature `redis-backing`) Redis.
//! - [`CachedKnowledgeBase`]: wraps a remote backend with a
//!   background-refreshed read-through cache.
//!
//! ## Guarantees
//! - Listing operations exclude tombstoned causes; `get_cause` does not
//! - Connectivity and query failures surface as `StorageError`
//! - `save_cause` is an idempotent upsert keyed by id
//!
//! ## NOT Responsible For
//! - Matching causes against logs (see `scan`)

pub mod cache;
pub mod cached;
pub mod document;
pub mod local;
#[cfg(feature = "redis-backing")]
pub mod redis_store;
pub mod sqlite;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

pub use cache::{CacheSnapshot, KnowledgeBaseCache};
pub use cached::CachedKnowledgeBase;
pub use document::{CauseQuery, DocumentDriver, DocumentKnowledgeBase};
pub use local::LocalFileKnowledgeBase;
#[cfg(feature = "redis-backing")]
pub use redis_store::RedisDriver;
pub use sqlite::SqliteDriver;

use crate::config::{BackendKind, KnowledgeBaseConfig};
use crate::error::{Result, ValidationError};
use crate::model::{CauseName, FailureCause, ShallowCause, Statistics, StatisticsFilter};

// ---------------------------------------------------------------------------
// KnowledgeBase trait
// ---------------------------------------------------------------------------

pub trait KnowledgeBase: Send + Sync {
    /// Short backend label for logs ("local", "sqlite", "redis").
    fn backend_name(&self) -> &'static str;

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    /// Look up one cause by id, tombstoned or not.
    fn get_cause(&self, id: &str) -> Result<Option<FailureCause>>;

    /// Every live cause, in definition order.
    fn get_causes(&self) -> Result<Vec<FailureCause>>;

    fn get_cause_names(&self) -> Result<Vec<CauseName>> {
        Ok(self.get_causes()?.iter().map(FailureCause::name_only).collect())
    }

    /// Live causes without indications, sorted by name.
    fn get_shallow_causes(&self) -> Result<Vec<ShallowCause>> {
        let mut out: Vec<ShallowCause> = self.get_causes()?.iter().map(FailureCause::shallow).collect();
        out.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(out)
    }

    /// Insert a new cause.  An id is assigned when the cause has none.
    fn add_cause(&self, cause: FailureCause) -> Result<FailureCause>;

    /// Upsert keyed by id; a cause without an id is added.
    fn save_cause(&self, cause: FailureCause) -> Result<FailureCause>;

    /// Tombstone a cause.  Returns the updated cause, or `None` for an
    /// unknown id.
    fn remove_cause(&self, id: &str, removed_by: &str) -> Result<Option<FailureCause>>;

    /// Distinct categories of live causes, sorted.
    fn get_categories(&self) -> Result<Vec<String>> {
        Ok(distinct_categories(&self.get_causes()?))
    }

    fn is_statistics_enabled(&self) -> bool;

    fn is_successful_logging_enabled(&self) -> bool;

    fn save_statistics(&self, stat: &Statistics) -> Result<()>;

    /// Newest first.  Empty when statistics are disabled.
    fn get_statistics(&self, filter: &StatisticsFilter, limit: Option<usize>) -> Result<Vec<Statistics>>;

    /// Move `last_occurred` of each listed cause forward to `time`.
    fn update_last_seen(&self, ids: &[String], time: u64) -> Result<()>;

    /// Copy every live cause of `old` into this knowledge base, keeping ids.
    /// Returns the number of causes copied.
    fn convert_from(&self, old: &dyn KnowledgeBase) -> Result<usize> {
        let causes = old.get_causes()?;
        let count = causes.len();
        for cause in causes {
            self.save_cause(cause)?;
        }
        info!(
            from = old.backend_name(),
            to = self.backend_name(),
            count,
            "converted knowledge base"
        );
        Ok(count)
    }
}

pub(crate) fn distinct_categories(causes: &[FailureCause]) -> Vec<String> {
    causes
        .iter()
        .filter(|c| !c.is_removed())
        .flat_map(|c| c.categories.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub(crate) fn new_cause_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the backend named by `cfg`.  Remote backends come wrapped in a
/// [`CachedKnowledgeBase`]; call `start()` before use.
pub fn open(cfg: &KnowledgeBaseConfig) -> Result<Arc<dyn KnowledgeBase>> {
    match cfg.backend {
        BackendKind::Local => {
            let kb = match &cfg.path {
                Some(path) => LocalFileKnowledgeBase::open(path)?,
                None => LocalFileKnowledgeBase::in_memory(),
            };
            Ok(Arc::new(kb))
        }
        BackendKind::Sqlite => {
            let path = cfg.path.as_ref().ok_or_else(|| {
                ValidationError::InvalidConfig("sqlite backend requires knowledge_base.path".into())
            })?;
            let driver = SqliteDriver::open(path)?;
            let backend = DocumentKnowledgeBase::new(driver, cfg.enable_statistics, cfg.successful_logging);
            Ok(Arc::new(CachedKnowledgeBase::new(Arc::new(backend), cfg.cache_refresh())))
        }
        #[cfg(feature = "redis-backing")]
        BackendKind::Redis => {
            let url = cfg.url.as_deref().ok_or_else(|| {
                ValidationError::InvalidConfig("redis backend requires knowledge_base.url".into())
            })?;
            let driver = RedisDriver::connect(url)?;
            let backend = DocumentKnowledgeBase::new(driver, cfg.enable_statistics, cfg.successful_logging);
            Ok(Arc::new(CachedKnowledgeBase::new(Arc::new(backend), cfg.cache_refresh())))
        }
        #[cfg(not(feature = "redis-backing"))]
        BackendKind::Redis => Err(ValidationError::InvalidConfig(
            "redis backend requires the `redis-backing` feature".into(),
        )
        .into()),
    }
}
