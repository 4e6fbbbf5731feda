//! # Stage: Configuration
//!
//! ## Responsibility
//! TOML-backed configuration for every service in the crate.  Each section
//! has a `Default` so a partial (or empty) file is valid.
//!
//! ## Guarantees
//! - Missing sections and keys fall back to defaults
//! - `validate()` rejects values that cannot work (zero timeouts, empty
//!   backend location); out-of-floor pool sizes are clamped, not rejected
//!
//! ## NOT Responsible For
//! - Watching the file for changes (callers pass a fresh config to
//!   `FailureAnalyzer::reload`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// AnalyzerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub scanner: ScannerConfig,
    pub knowledge_base: KnowledgeBaseConfig,
    pub scan_on_demand: ScanOnDemandConfig,
    pub migration: MigrationConfig,
}

impl AnalyzerConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ValidationError> {
        let cfg: AnalyzerConfig =
            toml::from_str(text).map_err(|e| ValidationError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let s = &self.scanner;
        if s.line_timeout_ms == 0 || s.file_timeout_ms == 0 || s.block_timeout_ms == 0 {
            return Err(ValidationError::InvalidConfig(
                "scanner timeouts must be greater than zero".into(),
            ));
        }
        if s.block_size <= s.block_overlap {
            return Err(ValidationError::InvalidConfig(format!(
                "scanner block_size ({}) must exceed block_overlap ({})",
                s.block_size, s.block_overlap
            )));
        }
        match self.knowledge_base.backend {
            BackendKind::Local => {}
            BackendKind::Sqlite if self.knowledge_base.path.is_none() => {
                return Err(ValidationError::InvalidConfig(
                    "sqlite backend requires knowledge_base.path".into(),
                ));
            }
            BackendKind::Redis if self.knowledge_base.url.is_none() => {
                return Err(ValidationError::InvalidConfig(
                    "redis backend requires knowledge_base.url".into(),
                ));
            }
            _ => {}
        }
        if self.knowledge_base.cache_refresh_secs == 0 {
            return Err(ValidationError::InvalidConfig(
                "knowledge_base.cache_refresh_secs must be greater than zero".into(),
            ));
        }
        if self.migration.pool_size == 0 {
            return Err(ValidationError::InvalidConfig(
                "migration.pool_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScannerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Per-line match budget for single-line indications (T1).
    pub line_timeout_ms: u64,
    /// Whole-file budget (T2).
    pub file_timeout_ms: u64,
    /// Per-window budget for multi-line indications.
    pub block_timeout_ms: u64,
    /// Multi-line window size in bytes.
    pub block_size: usize,
    /// Bytes shared by consecutive multi-line windows.
    pub block_overlap: usize,
    /// Process-wide cap on abandoned (still running) match workers.
    pub max_abandoned_workers: usize,
    /// Logs larger than this are not scanned.  0 disables the limit.
    pub max_log_size_mb: u64,
    /// Do not analyze aborted builds.
    pub skip_aborted: bool,
    /// Categories that mark generic causes, reported only when nothing more
    /// specific matched.
    pub fallback_categories: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            line_timeout_ms: 1_000,
            file_timeout_ms: 10_000,
            block_timeout_ms: 2_000,
            block_size: 15_000,
            block_overlap: 5_000,
            max_abandoned_workers: 16,
            max_log_size_mb: 0,
            skip_aborted: false,
            fallback_categories: Vec::new(),
        }
    }
}

impl ScannerConfig {
    pub fn line_timeout(&self) -> Duration {
        Duration::from_millis(self.line_timeout_ms)
    }

    pub fn file_timeout(&self) -> Duration {
        Duration::from_millis(self.file_timeout_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// KnowledgeBaseConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Sqlite,
    Redis,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Redis => write!(f, "redis"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    pub backend: BackendKind,
    /// JSON file for `local` (optional; in-memory when absent) or database
    /// file for `sqlite`.
    pub path: Option<PathBuf>,
    /// Connection URL for `redis`.
    pub url: Option<String>,
    pub enable_statistics: bool,
    /// Also record statistics for successful builds.
    pub successful_logging: bool,
    /// Refresh interval of the cache in front of remote backends.
    pub cache_refresh_secs: u64,
    /// Controller name written into statistics when a build has none.
    pub master_name: String,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            path: None,
            url: None,
            enable_statistics: false,
            successful_logging: false,
            cache_refresh_secs: 60,
            master_name: "local".to_string(),
        }
    }
}

impl KnowledgeBaseConfig {
    pub fn cache_refresh(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_secs)
    }
}

// ---------------------------------------------------------------------------
// ScanOnDemandConfig
// ---------------------------------------------------------------------------

pub const MIN_WORKERS_FLOOR: usize = 1;
pub const QUEUE_CAPACITY_FLOOR: usize = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOnDemandConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub keep_alive_secs: u64,
    pub queue_capacity: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for ScanOnDemandConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 5,
            keep_alive_secs: 15 * 60,
            queue_capacity: 1_000,
            shutdown_grace_secs: 30,
        }
    }
}

impl ScanOnDemandConfig {
    /// Copy with every value raised to its floor: `min >= 1`, `max >= min`,
    /// `capacity >= 1`.
    pub fn clamped(&self) -> Self {
        let min_workers = self.min_workers.max(MIN_WORKERS_FLOOR);
        Self {
            min_workers,
            max_workers: self.max_workers.max(min_workers),
            keep_alive_secs: self.keep_alive_secs,
            queue_capacity: self.queue_capacity.max(QUEUE_CAPACITY_FLOOR),
            shutdown_grace_secs: self.shutdown_grace_secs,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// MigrationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Delay between `convert()` and the conversion running.
    pub debounce_ms: u64,
    /// Worker threads of the scheduled-delay pool.
    pub pool_size: usize,
    /// Extra delay added per item when deferred items are released.
    pub stagger_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 3_000,
            pool_size: 10,
            stagger_ms: 100,
        }
    }
}

impl MigrationConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
