//! # Stage: Failure Analyzer
//!
//! ## Responsibility
//! Own every long-lived service (knowledge base and its cache, statistics
//! logger, scanner, scan-on-demand pool, migration pool) and expose the
//! host-facing lifecycle: start, build completed, rescan, reload, stop.
//!
//! ## Guarantees
//! - `stop()` shuts services down in dependency order: rescans first, then
//!   migrations, then statistics, then the knowledge base
//! - `reload()` applies pool sizing live; other changes are reported as
//!   requiring a restart
//!
//! ## NOT Responsible For
//! - Deciding when builds complete (the host calls `on_build_completed`)

use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::config::AnalyzerConfig;
use crate::error::Result;
use crate::kb::{self, KnowledgeBase};
use crate::migrate::{DeferredConverter, FoundIndicationConverter, MigrationPool};
use crate::model::{BuildRef, BuildStore};
use crate::scan::{BuildFailureScanner, ScanOutcome};
use crate::sod::{BuildLocks, ScanOnDemandQueue, ShutdownReport};
use crate::stats::StatisticsLogger;

pub struct FailureAnalyzer {
    config: RwLock<AnalyzerConfig>,
    kb: Arc<dyn KnowledgeBase>,
    builds: Arc<dyn BuildStore>,
    stats: Arc<StatisticsLogger>,
    scanner: Arc<BuildFailureScanner>,
    sod: ScanOnDemandQueue,
    migration: Arc<MigrationPool>,
    converter: DeferredConverter,
}

impl FailureAnalyzer {
    /// Open the configured knowledge base and wire the services around it.
    pub fn new(config: AnalyzerConfig, builds: Arc<dyn BuildStore>) -> Result<Self> {
        config.validate()?;
        let kb = kb::open(&config.knowledge_base)?;
        Self::with_knowledge_base(config, kb, builds)
    }

    pub fn with_knowledge_base(
        config: AnalyzerConfig,
        kb: Arc<dyn KnowledgeBase>,
        builds: Arc<dyn BuildStore>,
    ) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(StatisticsLogger::start(
            Arc::clone(&kb),
            config.knowledge_base.master_name.clone(),
        ));
        let scanner = Arc::new(BuildFailureScanner::new(
            Arc::clone(&kb),
            Arc::clone(&builds),
            Arc::clone(&stats),
            config.scanner.clone(),
        ));
        // Rescans and legacy conversion both rewrite found causes.
        let locks = Arc::new(BuildLocks::new());
        let sod = ScanOnDemandQueue::with_locks(&config.scan_on_demand, Arc::clone(&scanner), Arc::clone(&locks));
        let migration = Arc::new(MigrationPool::new(&config.migration)?);
        let converter = DeferredConverter::new(
            Arc::new(
                FoundIndicationConverter::new(Arc::clone(&migration), Arc::clone(&builds), config.migration.debounce())
                    .with_locks(locks),
            ),
            config.migration.stagger(),
        );
        Ok(Self {
            config: RwLock::new(config),
            kb,
            builds,
            stats,
            scanner,
            sod,
            migration,
            converter,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.kb.start()?;
        info!(backend = self.kb.backend_name(), "failure analyzer started");
        Ok(())
    }

    pub fn knowledge_base(&self) -> &Arc<dyn KnowledgeBase> {
        &self.kb
    }

    pub fn builds(&self) -> &Arc<dyn BuildStore> {
        &self.builds
    }

    pub fn config(&self) -> AnalyzerConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Scan a build that just finished, unless already scanned.
    pub fn on_build_completed(&self, build: &BuildRef) -> Result<ScanOutcome> {
        self.scanner.scan_if_not_scanned(build)
    }

    /// Queue an on-demand rescan.  Returns whether the pool accepted it.
    pub fn rescan(&self, build: BuildRef) -> bool {
        self.sod.queue(build)
    }

    /// Queue rescans of many builds; returns how many were accepted.
    pub fn rescan_all(&self, builds: impl IntoIterator<Item = BuildRef>) -> usize {
        builds.into_iter().filter(|b| self.sod.queue(b.clone())).count()
    }

    pub fn pending_rescans(&self) -> usize {
        self.sod.queue_size()
    }

    /// Request conversion of a build's legacy found indications.  Held
    /// back until [`on_loaded`](Self::on_loaded).
    pub fn convert_legacy(&self, build: BuildRef) {
        self.converter.convert(build);
    }

    pub fn on_loaded(&self) {
        self.converter.on_loaded();
    }

    pub fn migrations(&self) -> &DeferredConverter {
        &self.converter
    }

    /// Apply a changed configuration.  Pool sizing takes effect at once;
    /// scanner and knowledge-base changes need a restart.
    pub fn reload(&self, new: AnalyzerConfig) -> Result<()> {
        new.validate()?;
        let mut current = self.config.write().unwrap_or_else(|e| e.into_inner());
        if new.scan_on_demand != current.scan_on_demand {
            self.sod.reconfigure(&new.scan_on_demand);
        }
        if new.scanner != current.scanner || new.knowledge_base != current.knowledge_base {
            warn!("scanner or knowledge base settings changed, restart to apply them");
        }
        if new.migration != current.migration {
            warn!("migration settings changed, restart to apply them");
        }
        *current = new;
        Ok(())
    }

    pub fn stop(&self) -> ShutdownReport {
        let grace = self.config().scan_on_demand.shutdown_grace();
        let report = self.sod.shutdown(grace);
        self.migration.shutdown(grace);
        self.stats.stop();
        self.kb.stop();
        info!(dropped = report.dropped, stragglers = report.stragglers, "failure analyzer stopped");
        report
    }
}
