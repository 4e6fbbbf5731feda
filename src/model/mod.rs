//! Domain records shared by the scanner, the knowledge base and the workers.

pub mod build;
pub mod cause;
pub mod found;
pub mod indication;
pub mod result;
pub mod statistics;

pub use build::{BuildInfo, BuildRef, BuildStore, InMemoryBuildStore};
pub use cause::{CauseName, FailureCause, Modification, ShallowCause, Tombstone};
pub use found::{FoundFailureCause, FoundIndication};
pub use indication::{Indication, ReaderMode};
pub use result::BuildResult;
pub use statistics::{FailureCauseStatistics, Statistics, StatisticsFilter, UpstreamCause};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
