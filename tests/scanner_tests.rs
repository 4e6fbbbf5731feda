//! External tests for the bounded scanner: timeouts on pathological input,
//! first-match semantics and multi-line windows.

use std::ops::Range;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use build_failure_analyzer::config::ScannerConfig;
use build_failure_analyzer::model::{FailureCause, Indication, ReaderMode};
use build_failure_analyzer::scan::{match_causes, AbandonBudget, LineMatcher, ScanState, Scanner};

/// Stands in for a catastrophically backtracking pattern: any line holding
/// the marker takes far longer than the line budget.
struct Backtracking;

impl LineMatcher for Backtracking {
    fn find_range(&self, text: &str) -> Option<Range<usize>> {
        if text.contains("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa!") {
            thread::sleep(Duration::from_secs(15));
        }
        text.find("BUILD FAILED").map(|i| i..i + "BUILD FAILED".len())
    }
}

fn lines(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

// -- Timeouts --------------------------------------------------------------

#[test]
fn test_duplicated_worst_case_line_finishes_within_file_budget() {
    let cfg = ScannerConfig::default();
    let scanner = Scanner::with_budget(&cfg, Arc::new(AbandonBudget::new(64)));
    let worst = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa!".repeat(4);
    let mut log: Vec<String> = std::iter::repeat(worst).take(10).collect();
    log.push("BUILD FAILED".into());

    let start = Instant::now();
    let report = scanner.scan_with(Arc::new(Backtracking), ReaderMode::SingleLine, "BUILD FAILED", &log, "log");
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_secs(12), "scan took {elapsed:?}");
    assert!(report.found.is_none());
    assert_eq!(report.state, ScanState::ScanTimedOut);
    assert!(report.lines_timed_out >= 9);
}

#[test]
fn test_single_slow_line_is_skipped_and_scan_continues() {
    let cfg = ScannerConfig {
        line_timeout_ms: 50,
        file_timeout_ms: 5_000,
        ..ScannerConfig::default()
    };
    let scanner = Scanner::with_budget(&cfg, Arc::new(AbandonBudget::new(8)));
    let log = lines(&["start", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa!", "BUILD FAILED"]);
    let report = scanner.scan_with(Arc::new(Backtracking), ReaderMode::SingleLine, "BUILD FAILED", &log, "log");
    assert_eq!(report.state, ScanState::Found);
    assert_eq!(report.lines_timed_out, 1);
    assert_eq!(report.found.unwrap().matching_line, Some(3));
}

#[test]
fn test_nested_quantifier_regex_is_fast_on_long_line() {
    let scanner = Scanner::new(&ScannerConfig::default());
    let ind = Indication::single_line("(a+)+$").unwrap();
    let log = vec![format!("{}!", "a".repeat(50_000)); 10];
    let start = Instant::now();
    assert!(scanner.scan(&ind, &log, "log").is_none());
    assert!(start.elapsed() < Duration::from_secs(10));
}

// -- Matching semantics ----------------------------------------------------

#[test]
fn test_first_matching_line_is_reported() {
    let scanner = Scanner::new(&ScannerConfig::default());
    let ind = Indication::single_line(".*FATAL.*").unwrap();
    let log = lines(&["ok", "FATAL: disk", "FATAL: again"]);
    let found = scanner.scan(&ind, &log, "console").unwrap();
    assert_eq!(found.matching_line, Some(2));
    assert_eq!(found.matching_string.as_deref(), Some("FATAL: disk"));
    assert_eq!(found.matching_file, "console");
}

#[test]
fn test_single_line_pattern_is_anchored() {
    let scanner = Scanner::new(&ScannerConfig::default());
    let ind = Indication::single_line("FATAL").unwrap();
    assert!(scanner.scan(&ind, &lines(&["prefix FATAL"]), "log").is_none());
    assert!(scanner.scan(&ind, &lines(&["FATAL"]), "log").is_some());
}

#[test]
fn test_multi_line_pattern_spans_lines() {
    let scanner = Scanner::new(&ScannerConfig::default());
    let ind = Indication::multi_line("Caused by: java.lang.IllegalStateException\\n\\s+at com.example").unwrap();
    let log = lines(&[
        "Exception in thread main",
        "Caused by: java.lang.IllegalStateException",
        "    at com.example.App.run(App.java:10)",
    ]);
    let found = scanner.scan(&ind, &log, "log").unwrap();
    assert_eq!(found.matching_line, Some(2));
}

#[test]
fn test_two_indications_give_one_cause_with_two_hits() {
    let scanner = Scanner::new(&ScannerConfig::default());
    let cause = FailureCause::new("Flaky network", "")
        .with_id("net")
        .with_indication(Indication::single_line(".*Connection reset.*").unwrap())
        .with_indication(Indication::single_line(".*Read timed out.*").unwrap());
    let log = lines(&["Read timed out", "Connection reset by peer", "Connection reset by peer"]);
    let found = match_causes(&scanner, &[cause], &log, "log", None);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].indications.len(), 2);
    assert_eq!(found[0].indications[0].matching_line, Some(2));
    assert_eq!(found[0].indications[1].matching_line, Some(1));
}
