//! # Stage: Build Failure Scanner
//!
//! ## Responsibility
//! The entry point for a completed build: decide whether the build needs
//! scanning, run the cause matcher over its log, apply fallback
//! categories, attach the result to the build and hand it to the
//! statistics logger.
//!
//! ## Guarantees
//! - A build that already carries found causes is not scanned again (use
//!   [`BuildFailureScanner::rescan`] to force it)
//! - Knowledge-base or log read failures during a scan are logged and the
//!   build gets "no cause found"; they are never returned to the caller
//! - Only a failure to attach the result (build store error) is returned
//!
//! ## NOT Responsible For
//! - Serialising concurrent rescans of one build (see `sod::task`)

use std::sync::Arc;

use tracing::{debug, error, info};

use super::matcher::{apply_fallback_categories, match_causes};
use super::reader::Scanner;
use crate::config::ScannerConfig;
use crate::error::Result;
use crate::kb::KnowledgeBase;
use crate::model::{BuildInfo, BuildRef, BuildResult, BuildStore, FoundFailureCause};
use crate::stats::StatisticsLogger;

/// Label recorded as `matching_file` for matches in the console log.
pub const CONSOLE_LOG: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The build passed; nothing to analyze.
    Successful,
    /// The result filter excluded this build.
    Filtered(BuildResult),
    /// The log exceeds the configured size limit.
    LogTooLarge { bytes: u64, limit_bytes: u64 },
    /// Found causes were already attached.
    AlreadyScanned,
    Scanned(Vec<FoundFailureCause>),
}

pub struct BuildFailureScanner {
    kb: Arc<dyn KnowledgeBase>,
    builds: Arc<dyn BuildStore>,
    stats: Arc<StatisticsLogger>,
    scanner: Scanner,
    config: ScannerConfig,
}

impl BuildFailureScanner {
    pub fn new(
        kb: Arc<dyn KnowledgeBase>,
        builds: Arc<dyn BuildStore>,
        stats: Arc<StatisticsLogger>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            scanner: Scanner::new(&config),
            kb,
            builds,
            stats,
            config,
        }
    }

    pub fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn builds(&self) -> &Arc<dyn BuildStore> {
        &self.builds
    }

    fn log_limit_bytes(&self) -> Option<u64> {
        (self.config.max_log_size_mb > 0).then(|| self.config.max_log_size_mb * 1024 * 1024)
    }

    /// Scan a completed build unless it is filtered out or already scanned.
    pub fn scan_if_not_scanned(&self, build: &BuildRef) -> Result<ScanOutcome> {
        let info = self.builds.info(build)?;

        if info.result == BuildResult::Success {
            if self.kb.is_successful_logging_enabled() {
                self.stats.log(&info, &[]);
            }
            return Ok(ScanOutcome::Successful);
        }
        if !info.result.need_to_analyze(self.config.skip_aborted) {
            debug!(build = %build, result = %info.result, "build result filtered, not scanning");
            return Ok(ScanOutcome::Filtered(info.result));
        }
        if self.builds.found_causes(build)?.is_some() {
            debug!(build = %build, "build already scanned");
            return Ok(ScanOutcome::AlreadyScanned);
        }
        if let Some(limit) = self.log_limit_bytes() {
            if info.log_size_bytes > limit {
                info!(
                    build = %build,
                    bytes = info.log_size_bytes,
                    limit_bytes = limit,
                    "log exceeds size limit, not scanning"
                );
                return Ok(ScanOutcome::LogTooLarge {
                    bytes: info.log_size_bytes,
                    limit_bytes: limit,
                });
            }
        }

        self.scan(&info).map(ScanOutcome::Scanned)
    }

    /// Drop the build's previous result and scan it again.
    pub fn rescan(&self, build: &BuildRef) -> Result<Vec<FoundFailureCause>> {
        self.builds.remove_found_causes(build)?;
        let info = self.builds.info(build)?;
        self.scan(&info)
    }

    /// Match, attach and log.  Scan-side failures yield an empty result.
    pub fn scan(&self, info: &BuildInfo) -> Result<Vec<FoundFailureCause>> {
        let found = match self.find_causes(&info.build) {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, build = %info.build, "could not scan build, reporting no cause found");
                Vec::new()
            }
        };
        info!(build = %info.build, causes = found.len(), "build scanned");
        self.builds.attach_found_causes(&info.build, found.clone())?;
        self.stats.log(info, &found);
        Ok(found)
    }

    fn find_causes(&self, build: &BuildRef) -> Result<Vec<FoundFailureCause>> {
        let causes = self.kb.get_causes()?;
        let lines = self.builds.log_lines(build)?;
        let found = match_causes(&self.scanner, &causes, &lines, CONSOLE_LOG, Some(build));
        Ok(apply_fallback_categories(found, &self.config.fallback_categories))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::document::memory::MemoryDriver;
    use crate::kb::{DocumentKnowledgeBase, LocalFileKnowledgeBase};
    use crate::model::{FailureCause, Indication, InMemoryBuildStore, StatisticsFilter};

    struct Fixture {
        kb: Arc<DocumentKnowledgeBase<MemoryDriver>>,
        builds: Arc<InMemoryBuildStore>,
        scanner: BuildFailureScanner,
    }

    fn fixture(config: ScannerConfig, successful_logging: bool) -> Fixture {
        let kb = Arc::new(DocumentKnowledgeBase::new(MemoryDriver::default(), true, successful_logging));
        kb.add_cause(
            FailureCause::new("Disk full", "")
                .with_category("infra")
                .with_indication(Indication::single_line(".*No space left on device.*").unwrap()),
        )
        .unwrap();
        kb.add_cause(
            FailureCause::new("Something failed", "")
                .with_category("generic")
                .with_indication(Indication::single_line("BUILD FAILED").unwrap()),
        )
        .unwrap();
        let builds = Arc::new(InMemoryBuildStore::new());
        let stats = Arc::new(StatisticsLogger::start(kb.clone(), "ci"));
        let scanner = BuildFailureScanner::new(kb.clone(), builds.clone(), stats, config);
        Fixture { kb, builds, scanner }
    }

    fn add_build(builds: &InMemoryBuildStore, n: u64, result: BuildResult, log: &[&str]) -> BuildRef {
        let b = BuildRef::new("app", n);
        builds.insert(BuildInfo::new(b.clone(), result), log.iter().map(|s| s.to_string()).collect());
        b
    }

    fn flush(f: &Fixture) {
        f.scanner.stats.flush();
    }

    #[test]
    fn failed_build_is_scanned_and_attached() {
        let f = fixture(ScannerConfig::default(), false);
        let b = add_build(&f.builds, 1, BuildResult::Failure, &["write: No space left on device", "BUILD FAILED"]);
        let out = f.scanner.scan_if_not_scanned(&b).unwrap();
        let ScanOutcome::Scanned(found) = out else {
            panic!("expected the build to be scanned");
        };
        assert_eq!(found.len(), 2);
        assert_eq!(f.builds.found_causes(&b).unwrap().unwrap().len(), 2);
        flush(&f);
        assert_eq!(f.kb.get_statistics(&StatisticsFilter::default(), None).unwrap().len(), 1);
    }

    #[test]
    fn second_call_is_already_scanned() {
        let f = fixture(ScannerConfig::default(), false);
        let b = add_build(&f.builds, 1, BuildResult::Failure, &["BUILD FAILED"]);
        f.scanner.scan_if_not_scanned(&b).unwrap();
        assert_eq!(f.scanner.scan_if_not_scanned(&b).unwrap(), ScanOutcome::AlreadyScanned);
    }

    #[test]
    fn rescan_is_idempotent() {
        let f = fixture(ScannerConfig::default(), false);
        let b = add_build(&f.builds, 1, BuildResult::Failure, &["BUILD FAILED"]);
        let first = f.scanner.rescan(&b).unwrap();
        let second = f.scanner.rescan(&b).unwrap();
        assert_eq!(first, second);
        assert_eq!(f.builds.found_causes(&b).unwrap().unwrap(), second);
    }

    #[test]
    fn successful_build_not_scanned_but_logged_when_enabled() {
        let f = fixture(ScannerConfig::default(), true);
        let b = add_build(&f.builds, 1, BuildResult::Success, &["BUILD FAILED"]);
        assert_eq!(f.scanner.scan_if_not_scanned(&b).unwrap(), ScanOutcome::Successful);
        assert_eq!(f.builds.found_causes(&b).unwrap(), None);
        flush(&f);
        let stats = f.kb.get_statistics(&StatisticsFilter::default(), None).unwrap();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].failure_causes.is_empty());
    }

    #[test]
    fn aborted_filtered_when_configured() {
        let cfg = ScannerConfig {
            skip_aborted: true,
            ..ScannerConfig::default()
        };
        let f = fixture(cfg, false);
        let b = add_build(&f.builds, 1, BuildResult::Aborted, &["BUILD FAILED"]);
        assert_eq!(
            f.scanner.scan_if_not_scanned(&b).unwrap(),
            ScanOutcome::Filtered(BuildResult::Aborted)
        );
    }

    #[test]
    fn oversized_log_skipped() {
        let cfg = ScannerConfig {
            max_log_size_mb: 1,
            ..ScannerConfig::default()
        };
        let f = fixture(cfg, false);
        let big = "x".repeat(2 * 1024 * 1024);
        let b = add_build(&f.builds, 1, BuildResult::Failure, &[big.as_str()]);
        assert!(matches!(
            f.scanner.scan_if_not_scanned(&b).unwrap(),
            ScanOutcome::LogTooLarge { .. }
        ));
    }

    #[test]
    fn fallback_category_dropped_when_specific_found() {
        let cfg = ScannerConfig {
            fallback_categories: vec!["generic".into()],
            ..ScannerConfig::default()
        };
        let f = fixture(cfg, false);
        let b = add_build(&f.builds, 1, BuildResult::Failure, &["No space left on device!", "BUILD FAILED"]);
        let found = f.scanner.rescan(&b).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Disk full");
    }

    #[test]
    fn knowledge_base_failure_yields_no_cause() {
        let f = fixture(ScannerConfig::default(), false);
        let b = add_build(&f.builds, 1, BuildResult::Failure, &["BUILD FAILED"]);
        f.kb.driver().set_offline(true);
        let out = f.scanner.scan_if_not_scanned(&b).unwrap();
        assert_eq!(out, ScanOutcome::Scanned(vec![]));
        f.kb.driver().set_offline(false);
    }

    #[test]
    fn unknown_build_is_error() {
        let f = fixture(ScannerConfig::default(), false);
        assert!(f.scanner.scan_if_not_scanned(&BuildRef::new("nope", 1)).is_err());
    }

    #[test]
    fn local_backend_scans_without_statistics() {
        let kb = Arc::new(LocalFileKnowledgeBase::in_memory());
        kb.add_cause(FailureCause::new("x", "").with_indication(Indication::single_line("x").unwrap()))
            .unwrap();
        let builds = Arc::new(InMemoryBuildStore::new());
        let stats = Arc::new(StatisticsLogger::start(kb.clone(), "ci"));
        let s = BuildFailureScanner::new(kb, builds.clone(), stats, ScannerConfig::default());
        let b = add_build(&builds, 1, BuildResult::Unstable, &["x"]);
        assert!(matches!(s.scan_if_not_scanned(&b).unwrap(), ScanOutcome::Scanned(v) if v.len() == 1));
    }
}
