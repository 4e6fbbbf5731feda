//! # Stage: Bounded Pattern Scanner
//!
//! ## Responsibility
//! Evaluate one indication against one build log without ever hanging the
//! caller.  Every match attempt runs on an isolated worker thread; the
//! caller waits with a deadline and, on timeout, abandons the worker and
//! moves on.
//!
//! Two budgets bound a scan:
//!
//! - **line budget** (T1): a single line (or multi-line window) that takes
//!   longer than this is treated as non-matching and the scan continues
//! - **file budget** (T2): once the whole scan has used this much wall
//!   time, it stops and reports no match
//!
//! ## Guarantees
//! - `scan()` returns within T2 plus one scheduling quantum
//! - Timeouts are outcomes ([`ScanState`]), never errors; they are logged
//! - A healthy worker is reused for consecutive lines; a replacement is
//!   spawned only after an abandonment
//! - Abandoned workers still running are capped process-wide by an
//!   [`AbandonBudget`]; when the cap is hit the scan ends as
//!   `ScanTimedOut` instead of spawning more threads
//!
//! ## NOT Responsible For
//! - Killing runaway workers (threads cannot be killed; they finish their
//!   current match and exit)
//! - Choosing which indications to run (see `scan::matcher`)

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::ScannerConfig;
use crate::model::{FoundIndication, Indication, ReaderMode};

// ---------------------------------------------------------------------------
// LineMatcher
// ---------------------------------------------------------------------------

/// Anything that can locate a match in a piece of text.
///
/// Implemented for [`Regex`]; tests substitute deliberately slow matchers.
pub trait LineMatcher: Send + Sync + 'static {
    /// Byte range of the first match in `text`.
    fn find_range(&self, text: &str) -> Option<Range<usize>>;
}

impl LineMatcher for Regex {
    fn find_range(&self, text: &str) -> Option<Range<usize>> {
        self.find(text).map(|m| m.range())
    }
}

// ---------------------------------------------------------------------------
// ScanState / ScanReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    NotStarted,
    Scanning,
    Found,
    NotFound,
    /// The current line exceeded T1; the scan resumes with the next line.
    LineTimedOut,
    /// T2 elapsed (or the abandon budget ran out).  Terminal.
    ScanTimedOut,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::NotStarted => write!(f, "not_started"),
            ScanState::Scanning => write!(f, "scanning"),
            ScanState::Found => write!(f, "found"),
            ScanState::NotFound => write!(f, "not_found"),
            ScanState::LineTimedOut => write!(f, "line_timed_out"),
            ScanState::ScanTimedOut => write!(f, "scan_timed_out"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Terminal state: `Found`, `NotFound` or `ScanTimedOut`.
    pub state: ScanState,
    pub found: Option<FoundIndication>,
    pub lines_timed_out: usize,
    pub elapsed: Duration,
}

/// Tracks the scan state machine and logs each transition at debug level.
struct Progress {
    state: ScanState,
    lines_timed_out: usize,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: ScanState::NotStarted,
            lines_timed_out: 0,
        }
    }

    fn to(&mut self, next: ScanState) {
        debug!(from = %self.state, to = %next, "scanner state");
        if next == ScanState::LineTimedOut {
            self.lines_timed_out += 1;
        }
        self.state = next;
    }
}

// ---------------------------------------------------------------------------
// AbandonBudget
// ---------------------------------------------------------------------------

/// Counter of abandoned match workers that have not yet exited.
#[derive(Debug)]
pub struct AbandonBudget {
    running: AtomicUsize,
    cap: usize,
}

static GLOBAL_BUDGET: Lazy<Arc<AbandonBudget>> =
    Lazy::new(|| Arc::new(AbandonBudget::new(ScannerConfig::default().max_abandoned_workers)));

impl AbandonBudget {
    pub fn new(cap: usize) -> Self {
        Self {
            running: AtomicUsize::new(0),
            cap,
        }
    }

    /// The process-wide budget shared by every scanner built with
    /// [`Scanner::new`].
    pub fn global() -> Arc<AbandonBudget> {
        Arc::clone(&GLOBAL_BUDGET)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    fn try_acquire(&self) -> bool {
        self.running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.cap).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MatchWorker
// ---------------------------------------------------------------------------

type Job = (Arc<dyn LineMatcher>, String);

/// A thread that runs match jobs one at a time.
struct MatchWorker {
    jobs: mpsc::Sender<Job>,
    results: mpsc::Receiver<Option<Range<usize>>>,
    abandoned: Arc<AtomicBool>,
}

impl MatchWorker {
    fn spawn(budget: Arc<AbandonBudget>) -> Option<Self> {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (res_tx, res_rx) = mpsc::channel();
        let abandoned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&abandoned);
        let spawned = thread::Builder::new()
            .name("bfa-match-worker".into())
            .spawn(move || {
                while let Ok((matcher, text)) = job_rx.recv() {
                    let hit = matcher.find_range(&text);
                    if res_tx.send(hit).is_err() {
                        break;
                    }
                }
                // The flag is set before the job sender is dropped, so it is
                // visible here whenever this worker was abandoned.
                if flag.load(Ordering::SeqCst) {
                    budget.release();
                }
            });
        match spawned {
            Ok(_) => Some(Self {
                jobs: job_tx,
                results: res_rx,
                abandoned,
            }),
            Err(e) => {
                warn!(error = %e, "failed to spawn match worker");
                None
            }
        }
    }

    /// Leave the worker to finish on its own.  Budget must already be held.
    fn abandon(self) {
        self.abandoned.store(true, Ordering::SeqCst);
        drop(self.jobs);
    }
}

enum Attempt {
    Hit(Option<Range<usize>>),
    TimedOut,
    WorkerLost,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Scanner {
    line_timeout: Duration,
    file_timeout: Duration,
    block_timeout: Duration,
    block_size: usize,
    block_overlap: usize,
    budget: Arc<AbandonBudget>,
}

impl Scanner {
    pub fn new(cfg: &ScannerConfig) -> Self {
        Self::with_budget(cfg, AbandonBudget::global())
    }

    pub fn with_budget(cfg: &ScannerConfig, budget: Arc<AbandonBudget>) -> Self {
        Self {
            line_timeout: cfg.line_timeout(),
            file_timeout: cfg.file_timeout(),
            block_timeout: cfg.block_timeout(),
            block_size: cfg.block_size.max(1),
            block_overlap: cfg.block_overlap.min(cfg.block_size.saturating_sub(1)),
            budget,
        }
    }

    pub fn budget(&self) -> &Arc<AbandonBudget> {
        &self.budget
    }

    /// First occurrence of `indication` in `lines`, or `None` when it does
    /// not match or the scan ran out of time.
    pub fn scan(&self, indication: &Indication, lines: &[String], file: &str) -> Option<FoundIndication> {
        self.scan_detailed(indication, lines, file).found
    }

    pub fn scan_detailed(&self, indication: &Indication, lines: &[String], file: &str) -> ScanReport {
        let matcher: Arc<dyn LineMatcher> = Arc::new(indication.compiled().clone());
        self.scan_with(matcher, indication.mode(), indication.pattern(), lines, file)
    }

    /// Scan with an arbitrary matcher.  `pattern` is only used to label the
    /// result and the log lines.
    pub fn scan_with(
        &self,
        matcher: Arc<dyn LineMatcher>,
        mode: ReaderMode,
        pattern: &str,
        lines: &[String],
        file: &str,
    ) -> ScanReport {
        let started = Instant::now();
        let mut progress = Progress::new();
        progress.to(ScanState::Scanning);

        let found = match mode {
            ReaderMode::SingleLine => self.scan_lines(&matcher, pattern, lines, file, started, &mut progress),
            ReaderMode::MultiLine => self.scan_blocks(&matcher, pattern, lines, file, started, &mut progress),
        };

        if progress.state != ScanState::ScanTimedOut {
            progress.to(if found.is_some() {
                ScanState::Found
            } else {
                ScanState::NotFound
            });
        }
        ScanReport {
            state: progress.state,
            found,
            lines_timed_out: progress.lines_timed_out,
            elapsed: started.elapsed(),
        }
    }

    fn scan_lines(
        &self,
        matcher: &Arc<dyn LineMatcher>,
        pattern: &str,
        lines: &[String],
        file: &str,
        started: Instant,
        progress: &mut Progress,
    ) -> Option<FoundIndication> {
        let mut worker = None;
        for (idx, line) in lines.iter().enumerate() {
            match self.attempt(&mut worker, matcher, line.clone(), self.line_timeout, started) {
                Some(Attempt::Hit(Some(_))) => {
                    return Some(FoundIndication::new(pattern, file, idx + 1, line.clone()));
                }
                Some(Attempt::Hit(None)) => {}
                Some(Attempt::TimedOut) => {
                    warn!(pattern, file, line = idx + 1, "pattern timed out on line, skipping it");
                    progress.to(ScanState::LineTimedOut);
                    progress.to(ScanState::Scanning);
                }
                Some(Attempt::WorkerLost) | None => {
                    self.log_scan_timeout(pattern, file, started);
                    progress.to(ScanState::ScanTimedOut);
                    return None;
                }
            }
        }
        None
    }

    fn scan_blocks(
        &self,
        matcher: &Arc<dyn LineMatcher>,
        pattern: &str,
        lines: &[String],
        file: &str,
        started: Instant,
        progress: &mut Progress,
    ) -> Option<FoundIndication> {
        let text = lines.join("\n");
        let mut worker = None;
        for window in windows(&text, self.block_size, self.block_overlap) {
            let block = text[window.clone()].to_string();
            match self.attempt(&mut worker, matcher, block, self.block_timeout, started) {
                Some(Attempt::Hit(Some(hit))) => {
                    let abs_start = window.start + hit.start;
                    let abs_end = window.start + hit.end;
                    let line = text[..abs_start].matches('\n').count() + 1;
                    return Some(FoundIndication::new(pattern, file, line, &text[abs_start..abs_end]));
                }
                Some(Attempt::Hit(None)) => {}
                Some(Attempt::TimedOut) => {
                    warn!(pattern, file, offset = window.start, "pattern timed out on block, skipping it");
                    progress.to(ScanState::LineTimedOut);
                    progress.to(ScanState::Scanning);
                }
                Some(Attempt::WorkerLost) | None => {
                    self.log_scan_timeout(pattern, file, started);
                    progress.to(ScanState::ScanTimedOut);
                    return None;
                }
            }
        }
        None
    }

    /// Run one match on the worker, spawning one if needed.
    ///
    /// `None` means the scan must stop: T2 is spent or no worker can be had.
    fn attempt(
        &self,
        worker: &mut Option<MatchWorker>,
        matcher: &Arc<dyn LineMatcher>,
        text: String,
        per_item: Duration,
        started: Instant,
    ) -> Option<Attempt> {
        let remaining = self.file_timeout.checked_sub(started.elapsed())?;
        if remaining.is_zero() {
            return None;
        }
        if worker.is_none() {
            *worker = MatchWorker::spawn(Arc::clone(&self.budget));
        }
        let w = worker.as_ref()?;
        if w.jobs.send((Arc::clone(matcher), text)).is_err() {
            *worker = None;
            return Some(Attempt::WorkerLost);
        }

        let wait = per_item.min(remaining);
        match w.results.recv_timeout(wait) {
            Ok(hit) => Some(Attempt::Hit(hit)),
            Err(RecvTimeoutError::Disconnected) => {
                *worker = None;
                Some(Attempt::WorkerLost)
            }
            Err(RecvTimeoutError::Timeout) => {
                let stuck = worker.take()?;
                if !self.budget.try_acquire() {
                    warn!(
                        cap = self.budget.cap(),
                        "abandoned match worker cap reached, ending scan"
                    );
                    // Dropping the sender still lets the thread exit after its
                    // current match; it just is not counted.
                    drop(stuck);
                    return None;
                }
                stuck.abandon();
                if wait < per_item {
                    // The file budget, not the line budget, ran out.
                    return None;
                }
                Some(Attempt::TimedOut)
            }
        }
    }

    fn log_scan_timeout(&self, pattern: &str, file: &str, started: Instant) {
        warn!(
            pattern,
            file,
            elapsed_ms = started.elapsed().as_millis() as u64,
            budget_ms = self.file_timeout.as_millis() as u64,
            "scan timed out, reporting no match"
        );
    }
}

/// Byte ranges of overlapping windows over `text`, cut on char boundaries.
fn windows(text: &str, size: usize, overlap: usize) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    if text.is_empty() {
        return out;
    }
    let mut start = 0;
    loop {
        let mut end = (start + size).min(text.len());
        while !text.is_char_boundary(end) {
            end += 1;
        }
        out.push(start..end);
        if end >= text.len() {
            break;
        }
        let mut next = end.saturating_sub(overlap).max(start + 1);
        while !text.is_char_boundary(next) {
            next += 1;
        }
        start = next;
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Sleeps on lines containing `SLOW`, matches lines equal to `target`.
    struct SlowMatcher {
        delay: Duration,
        target: &'static str,
    }

    impl LineMatcher for SlowMatcher {
        fn find_range(&self, text: &str) -> Option<Range<usize>> {
            if text.contains("SLOW") {
                thread::sleep(self.delay);
            }
            (text == self.target).then(|| 0..text.len())
        }
    }

    fn cfg(line_ms: u64, file_ms: u64) -> ScannerConfig {
        ScannerConfig {
            line_timeout_ms: line_ms,
            file_timeout_ms: file_ms,
            block_timeout_ms: line_ms,
            ..ScannerConfig::default()
        }
    }

    fn scanner(line_ms: u64, file_ms: u64) -> Scanner {
        Scanner::with_budget(&cfg(line_ms, file_ms), Arc::new(AbandonBudget::new(64)))
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // Single-line
    // -----------------------------------------------------------------------

    #[test]
    fn returns_first_matching_line() {
        let s = scanner(1_000, 10_000);
        let ind = Indication::single_line("ERROR .*").unwrap();
        let log = lines(&["ok", "ERROR one", "ERROR two"]);
        let f = s.scan(&ind, &log, "build.log").unwrap();
        assert_eq!(f.matching_line, Some(2));
        assert_eq!(f.matching_string.as_deref(), Some("ERROR one"));
        assert_eq!(f.pattern, "ERROR .*");
        assert_eq!(f.matching_file, "build.log");
    }

    #[test]
    fn no_match_reports_not_found() {
        let s = scanner(1_000, 10_000);
        let ind = Indication::single_line("nothing").unwrap();
        let r = s.scan_detailed(&ind, &lines(&["a", "b"]), "log");
        assert_eq!(r.state, ScanState::NotFound);
        assert!(r.found.is_none());
    }

    #[test]
    fn empty_log_is_not_found() {
        let s = scanner(1_000, 10_000);
        let ind = Indication::single_line(".*").unwrap();
        assert_eq!(s.scan_detailed(&ind, &[], "log").state, ScanState::NotFound);
    }

    #[test]
    fn slow_line_is_skipped_and_scan_continues() {
        let s = scanner(50, 5_000);
        let m: Arc<dyn LineMatcher> = Arc::new(SlowMatcher {
            delay: Duration::from_millis(500),
            target: "hit",
        });
        let log = lines(&["SLOW", "miss", "hit"]);
        let r = s.scan_with(m, ReaderMode::SingleLine, "p", &log, "log");
        assert_eq!(r.state, ScanState::Found);
        assert_eq!(r.lines_timed_out, 1);
        assert_eq!(r.found.unwrap().matching_line, Some(3));
    }

    #[test]
    fn file_budget_ends_scan() {
        let s = scanner(100, 350);
        let m: Arc<dyn LineMatcher> = Arc::new(SlowMatcher {
            delay: Duration::from_millis(1_000),
            target: "hit",
        });
        let log = lines(&["SLOW"; 20]);
        let r = s.scan_with(m, ReaderMode::SingleLine, "p", &log, "log");
        assert_eq!(r.state, ScanState::ScanTimedOut);
        assert!(r.found.is_none());
        assert!(r.elapsed < Duration::from_millis(900), "elapsed {:?}", r.elapsed);
    }

    #[test]
    fn abandon_cap_ends_scan() {
        let budget = Arc::new(AbandonBudget::new(1));
        let s = Scanner::with_budget(&cfg(30, 5_000), Arc::clone(&budget));
        let m: Arc<dyn LineMatcher> = Arc::new(SlowMatcher {
            delay: Duration::from_millis(400),
            target: "hit",
        });
        let log = lines(&["SLOW", "SLOW", "SLOW", "hit"]);
        let r = s.scan_with(m, ReaderMode::SingleLine, "p", &log, "log");
        assert_eq!(r.state, ScanState::ScanTimedOut);
        assert_eq!(r.lines_timed_out, 1);
        assert!(budget.running() <= 1);
    }

    #[test]
    fn abandoned_workers_release_budget_on_exit() {
        let budget = Arc::new(AbandonBudget::new(8));
        let s = Scanner::with_budget(&cfg(20, 5_000), Arc::clone(&budget));
        let m: Arc<dyn LineMatcher> = Arc::new(SlowMatcher {
            delay: Duration::from_millis(100),
            target: "x",
        });
        s.scan_with(m, ReaderMode::SingleLine, "p", &lines(&["SLOW", "SLOW"]), "log");
        assert!(budget.running() >= 1);
        assert!(wait_until(Duration::from_secs(5), || budget.running() == 0));
    }

    // -----------------------------------------------------------------------
    // Multi-line
    // -----------------------------------------------------------------------

    #[test]
    fn multi_line_match_spans_lines() {
        let s = scanner(1_000, 10_000);
        let ind = Indication::multi_line("Caused by:.*\\n.*at com\\.example").unwrap();
        let log = lines(&["start", "Caused by: boom", "    at com.example.Main", "end"]);
        let f = s.scan(&ind, &log, "log").unwrap();
        assert_eq!(f.matching_line, Some(2));
        assert_eq!(
            f.matching_string.as_deref(),
            Some("Caused by: boom\n    at com.example.Main")
        );
    }

    #[test]
    fn multi_line_match_across_window_boundary() {
        let config = ScannerConfig {
            block_size: 64,
            block_overlap: 32,
            ..ScannerConfig::default()
        };
        let s = Scanner::with_budget(&config, Arc::new(AbandonBudget::new(4)));
        let mut log: Vec<String> = (0..20).map(|i| format!("filler line {i:02}")).collect();
        log.push("needle-a".into());
        log.push("needle-b".into());
        let ind = Indication::multi_line("needle-a\\nneedle-b").unwrap();
        let f = s.scan(&ind, &log, "log").unwrap();
        assert_eq!(f.matching_line, Some(21));
    }

    #[test]
    fn windows_cover_text_with_overlap() {
        let w = windows("abcdefghij", 4, 2);
        assert_eq!(w.first(), Some(&(0..4)));
        assert_eq!(w.last().map(|r| r.end), Some(10));
        for pair in w.windows(2) {
            assert!(pair[1].start < pair[0].end);
        }
    }

    #[test]
    fn windows_respect_char_boundaries() {
        let text = "ééééé";
        for r in windows(text, 3, 1) {
            assert!(text.is_char_boundary(r.start));
            assert!(text.is_char_boundary(r.end));
        }
    }

    #[test]
    fn windows_of_empty_text() {
        assert!(windows("", 10, 2).is_empty());
    }
}
