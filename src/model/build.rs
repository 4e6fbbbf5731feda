//! # Stage: Build Records
//!
//! ## Responsibility
//! The host-facing seam: how the analyzer reads a build's log and metadata
//! and where it stores the causes found for it.  Hosts implement
//! [`BuildStore`]; [`InMemoryBuildStore`] backs the CLI and the tests.
//!
//! ## NOT Responsible For
//! - Log retention or archival (owned by the host)

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::found::FoundFailureCause;
use super::result::BuildResult;
use super::statistics::UpstreamCause;
use crate::error::{Result, StorageError};

// ---------------------------------------------------------------------------
// BuildRef
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildRef {
    pub project: String,
    pub number: u64,
}

impl BuildRef {
    pub fn new(project: impl Into<String>, number: u64) -> Self {
        Self {
            project: project.into(),
            number,
        }
    }
}

impl fmt::Display for BuildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.project, self.number)
    }
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub build: BuildRef,
    pub display_name: String,
    pub result: BuildResult,
    pub start_time_ms: u64,
    pub duration_ms: u64,
    /// Agent the build ran on; `None` when the host does not know.
    pub node_name: Option<String>,
    pub master: Option<String>,
    pub trigger_causes: Vec<String>,
    pub upstream: Option<UpstreamCause>,
    pub time_zone_offset: String,
    pub log_size_bytes: u64,
}

impl BuildInfo {
    pub fn new(build: BuildRef, result: BuildResult) -> Self {
        Self {
            display_name: format!("#{}", build.number),
            build,
            result,
            start_time_ms: 0,
            duration_ms: 0,
            node_name: None,
            master: None,
            trigger_causes: Vec::new(),
            upstream: None,
            time_zone_offset: "+00:00".to_string(),
            log_size_bytes: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// BuildStore
// ---------------------------------------------------------------------------

pub trait BuildStore: Send + Sync {
    fn log_lines(&self, build: &BuildRef) -> Result<Vec<String>>;

    fn info(&self, build: &BuildRef) -> Result<BuildInfo>;

    /// `None` when the build has never been scanned.
    fn found_causes(&self, build: &BuildRef) -> Result<Option<Vec<FoundFailureCause>>>;

    fn attach_found_causes(&self, build: &BuildRef, causes: Vec<FoundFailureCause>) -> Result<()>;

    fn remove_found_causes(&self, build: &BuildRef) -> Result<()>;

    /// Every build the store knows about.
    fn builds(&self) -> Result<Vec<BuildRef>>;
}

// ---------------------------------------------------------------------------
// InMemoryBuildStore
// ---------------------------------------------------------------------------

struct BuildRecord {
    info: BuildInfo,
    log: Vec<String>,
    found: Option<Vec<FoundFailureCause>>,
}

#[derive(Default)]
pub struct InMemoryBuildStore {
    records: RwLock<HashMap<BuildRef, BuildRecord>>,
}

impl InMemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a completed build.  `log_size_bytes` is derived from the log.
    pub fn insert(&self, mut info: BuildInfo, log: Vec<String>) {
        info.log_size_bytes = log.iter().map(|l| l.len() as u64 + 1).sum();
        let key = info.build.clone();
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(
            key,
            BuildRecord {
                info,
                log,
                found: None,
            },
        );
    }

    fn with_record<T>(&self, build: &BuildRef, f: impl FnOnce(&BuildRecord) -> T) -> Result<T> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .get(build)
            .map(f)
            .ok_or_else(|| StorageError::BuildNotFound(build.to_string()).into())
    }

    fn with_record_mut<T>(&self, build: &BuildRef, f: impl FnOnce(&mut BuildRecord) -> T) -> Result<T> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .get_mut(build)
            .map(f)
            .ok_or_else(|| StorageError::BuildNotFound(build.to_string()).into())
    }
}

impl BuildStore for InMemoryBuildStore {
    fn log_lines(&self, build: &BuildRef) -> Result<Vec<String>> {
        self.with_record(build, |r| r.log.clone())
    }

    fn info(&self, build: &BuildRef) -> Result<BuildInfo> {
        self.with_record(build, |r| r.info.clone())
    }

    fn found_causes(&self, build: &BuildRef) -> Result<Option<Vec<FoundFailureCause>>> {
        self.with_record(build, |r| r.found.clone())
    }

    fn attach_found_causes(&self, build: &BuildRef, causes: Vec<FoundFailureCause>) -> Result<()> {
        self.with_record_mut(build, |r| r.found = Some(causes))
    }

    fn remove_found_causes(&self, build: &BuildRef) -> Result<()> {
        self.with_record_mut(build, |r| r.found = None)
    }

    fn builds(&self) -> Result<Vec<BuildRef>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<BuildRef> = records.keys().cloned().collect();
        out.sort();
        Ok(out)
    }
}
