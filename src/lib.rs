//! Build failure analysis: match completed build logs against a knowledge
//! base of known failure causes, record statistics, and rescan on demand.
//!
//! The host owns builds and their logs (through [`model::BuildStore`]) and
//! drives a [`FailureAnalyzer`]; everything else runs on the analyzer's own
//! workers.

pub mod analyzer;
pub mod cli;
pub mod config;
pub mod downstream;
pub mod error;
pub mod kb;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod scan;
pub mod sod;
pub mod stats;

pub use analyzer::FailureAnalyzer;
pub use config::AnalyzerConfig;
pub use error::{Error, RejectedTask, Result, StorageError, ValidationError};
pub use kb::KnowledgeBase;
pub use model::{
    BuildInfo, BuildRef, BuildResult, BuildStore, FailureCause, FoundFailureCause, FoundIndication, Indication,
    ReaderMode, Statistics, StatisticsFilter,
};
pub use scan::{BuildFailureScanner, ScanOutcome, Scanner};
