//! # Stage: Document Knowledge Base
//!
//! ## Responsibility
//! Implements the [`KnowledgeBase`] contract once, on top of any
//! [`DocumentDriver`].  Drivers only know how to store and fetch documents;
//! id assignment, validation, tombstoning and last-seen bookkeeping live here
//! so every remote backend behaves identically.
//!
//! ## Guarantees
//! - `add_cause` assigns a UUID v4 when the cause has no id
//! - `save_cause` falls back to insert when the id is unknown
//! - Statistics calls are no-ops when statistics are disabled
//! - Background writers (last-seen bookkeeping, tombstones) change only
//!   their own field, in one driver call, so interactive edits survive

use tracing::debug;

use super::{new_cause_id, KnowledgeBase};
use crate::error::{Result, StorageError};
use crate::model::{now_ms, FailureCause, Statistics, StatisticsFilter, Tombstone};

// ---------------------------------------------------------------------------
// Driver contract
// ---------------------------------------------------------------------------

/// Which causes a [`DocumentDriver::find`] should return.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CauseQuery {
    pub include_removed: bool,
    pub category: Option<String>,
}

impl CauseQuery {
    pub fn live() -> Self {
        Self::default()
    }

    pub(crate) fn matches(&self, cause: &FailureCause) -> bool {
        if !self.include_removed && cause.is_removed() {
            return false;
        }
        match &self.category {
            Some(cat) => cause.has_category(cat),
            None => true,
        }
    }
}

/// Storage primitives a remote backend must provide.
pub trait DocumentDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn get(&self, id: &str) -> std::result::Result<Option<FailureCause>, StorageError>;

    /// Matching causes in insertion order.
    fn find(&self, query: &CauseQuery) -> std::result::Result<Vec<FailureCause>, StorageError>;

    fn insert(&self, cause: &FailureCause) -> std::result::Result<(), StorageError>;

    /// Replace an existing document.  Returns `false` when the id is unknown.
    fn update(&self, cause: &FailureCause) -> std::result::Result<bool, StorageError>;

    /// Set the tombstone on a document.  Returns the updated cause.
    ///
    /// Must be a single atomic read-modify-write: other fields are left as
    /// the store holds them at the time of the write.
    fn tombstone(&self, id: &str, tombstone: &Tombstone) -> std::result::Result<Option<FailureCause>, StorageError>;

    /// Move `lastOccurred` forward to `time`, touching no other field.
    /// Returns `true` when the stored value changed; unknown ids are `false`.
    fn touch_last_occurred(&self, id: &str, time: u64) -> std::result::Result<bool, StorageError>;

    fn append_statistics(&self, stat: &Statistics) -> std::result::Result<(), StorageError>;

    /// Newest first.
    fn find_statistics(
        &self,
        filter: &StatisticsFilter,
        limit: Option<usize>,
    ) -> std::result::Result<Vec<Statistics>, StorageError>;
}

// ---------------------------------------------------------------------------
// DocumentKnowledgeBase
// ---------------------------------------------------------------------------

pub struct DocumentKnowledgeBase<D> {
    driver: D,
    enable_statistics: bool,
    successful_logging: bool,
}

impl<D: DocumentDriver> DocumentKnowledgeBase<D> {
    pub fn new(driver: D, enable_statistics: bool, successful_logging: bool) -> Self {
        Self {
            driver,
            enable_statistics,
            successful_logging,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Causes matching an arbitrary query, tombstoned ones included if asked.
    pub fn find(&self, query: &CauseQuery) -> Result<Vec<FailureCause>> {
        Ok(self.driver.find(query)?)
    }
}

impl<D: DocumentDriver> KnowledgeBase for DocumentKnowledgeBase<D> {
    fn backend_name(&self) -> &'static str {
        self.driver.name()
    }

    fn get_cause(&self, id: &str) -> Result<Option<FailureCause>> {
        Ok(self.driver.get(id)?)
    }

    fn get_causes(&self) -> Result<Vec<FailureCause>> {
        Ok(self.driver.find(&CauseQuery::live())?)
    }

    fn add_cause(&self, mut cause: FailureCause) -> Result<FailureCause> {
        cause.validate()?;
        if cause.is_new() {
            cause.id = new_cause_id();
        }
        self.driver.insert(&cause)?;
        debug!(backend = self.driver.name(), id = %cause.id, name = %cause.name, "cause added");
        Ok(cause)
    }

    fn save_cause(&self, cause: FailureCause) -> Result<FailureCause> {
        if cause.is_new() {
            return self.add_cause(cause);
        }
        cause.validate()?;
        if !self.driver.update(&cause)? {
            self.driver.insert(&cause)?;
        }
        Ok(cause)
    }

    fn remove_cause(&self, id: &str, removed_by: &str) -> Result<Option<FailureCause>> {
        let tombstone = Tombstone {
            by: removed_by.to_string(),
            time: now_ms(),
        };
        Ok(self.driver.tombstone(id, &tombstone)?)
    }

    fn is_statistics_enabled(&self) -> bool {
        self.enable_statistics
    }

    fn is_successful_logging_enabled(&self) -> bool {
        self.successful_logging
    }

    fn save_statistics(&self, stat: &Statistics) -> Result<()> {
        if !self.enable_statistics {
            return Ok(());
        }
        Ok(self.driver.append_statistics(stat)?)
    }

    fn get_statistics(&self, filter: &StatisticsFilter, limit: Option<usize>) -> Result<Vec<Statistics>> {
        if !self.enable_statistics {
            return Ok(Vec::new());
        }
        Ok(self.driver.find_statistics(filter, limit)?)
    }

    fn update_last_seen(&self, ids: &[String], time: u64) -> Result<()> {
        for id in ids {
            if self.driver.touch_last_occurred(id, time)? {
                debug!(backend = self.driver.name(), id = %id, time, "last occurrence moved");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory driver (tests)
// ---------------------------------------------------------------------------
