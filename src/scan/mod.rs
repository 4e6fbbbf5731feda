//! Log scanning: the bounded per-indication reader, the cause matcher, and
//! the build-completion scanner service built on them.

pub mod matcher;
pub mod reader;
pub mod service;

pub use matcher::{apply_fallback_categories, match_causes};
pub use reader::{AbandonBudget, LineMatcher, ScanReport, ScanState, Scanner};
pub use service::{BuildFailureScanner, ScanOutcome};
