//! # Stage: Local Knowledge Base
//!
//! ## Responsibility
//! Keeps the cause catalog in process, optionally mirrored to a JSON file
//! after every write.  Suitable for single-controller installs and tests.
//!
//! ## Guarantees
//! - File writes go through a temporary file and a rename, so a crash never
//!   leaves a truncated catalog
//! - Statistics are not supported: `save_statistics` is a no-op and
//!   `get_statistics` is always empty

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use super::{new_cause_id, KnowledgeBase};
use crate::error::{Result, StorageError};
use crate::model::{now_ms, FailureCause, Statistics, StatisticsFilter, Tombstone};

pub struct LocalFileKnowledgeBase {
    causes: RwLock<Vec<FailureCause>>,
    path: Option<PathBuf>,
}

impl LocalFileKnowledgeBase {
    pub fn in_memory() -> Self {
        Self {
            causes: RwLock::new(Vec::new()),
            path: None,
        }
    }

    /// Load the catalog from `path`, or start empty if the file does not
    /// exist yet.
    pub fn open(path: impl AsRef<Path>) -> std::result::Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let causes = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| StorageError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            serde_json::from_str(&text)?
        } else {
            Vec::new()
        };
        Ok(Self {
            causes: RwLock::new(causes),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, causes: &[FailureCause]) -> std::result::Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |e: std::io::Error| StorageError::Io {
            path: path.display().to_string(),
            source: e,
        };
        let json = serde_json::to_string_pretty(causes)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        debug!(path = %path.display(), count = causes.len(), "knowledge base written");
        Ok(())
    }

    /// Apply `f` under the write lock and persist if it reports a change.
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<FailureCause>) -> (T, bool)) -> Result<T> {
        let mut causes = self.causes.write().unwrap_or_else(|e| e.into_inner());
        let (out, changed) = f(&mut causes);
        if changed {
            self.persist(&causes)?;
        }
        Ok(out)
    }
}

impl KnowledgeBase for LocalFileKnowledgeBase {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn get_cause(&self, id: &str) -> Result<Option<FailureCause>> {
        let causes = self.causes.read().unwrap_or_else(|e| e.into_inner());
        Ok(causes.iter().find(|c| c.id == id).cloned())
    }

    fn get_causes(&self) -> Result<Vec<FailureCause>> {
        let causes = self.causes.read().unwrap_or_else(|e| e.into_inner());
        Ok(causes.iter().filter(|c| !c.is_removed()).cloned().collect())
    }

    fn add_cause(&self, mut cause: FailureCause) -> Result<FailureCause> {
        cause.validate()?;
        if cause.is_new() {
            cause.id = new_cause_id();
        }
        self.mutate(|causes| {
            causes.push(cause.clone());
            (cause, true)
        })
    }

    fn save_cause(&self, cause: FailureCause) -> Result<FailureCause> {
        if cause.is_new() {
            return self.add_cause(cause);
        }
        cause.validate()?;
        self.mutate(|causes| {
            match causes.iter_mut().find(|c| c.id == cause.id) {
                Some(slot) => *slot = cause.clone(),
                None => causes.push(cause.clone()),
            }
            (cause, true)
        })
    }

    fn remove_cause(&self, id: &str, removed_by: &str) -> Result<Option<FailureCause>> {
        let tombstone = Tombstone {
            by: removed_by.to_string(),
            time: now_ms(),
        };
        self.mutate(|causes| match causes.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.removed = Some(tombstone);
                (Some(c.clone()), true)
            }
            None => (None, false),
        })
    }

    fn is_statistics_enabled(&self) -> bool {
        false
    }

    fn is_successful_logging_enabled(&self) -> bool {
        false
    }

    fn save_statistics(&self, _stat: &Statistics) -> Result<()> {
        Ok(())
    }

    fn get_statistics(&self, _filter: &StatisticsFilter, _limit: Option<usize>) -> Result<Vec<Statistics>> {
        Ok(Vec::new())
    }

    fn update_last_seen(&self, ids: &[String], time: u64) -> Result<()> {
        self.mutate(|causes| {
            let mut changed = false;
            for cause in causes.iter_mut().filter(|c| ids.contains(&c.id)) {
                changed |= cause.touch_last_occurred(time);
            }
            ((), changed)
        })
    }
}
