//! # Stage: Build Statistics
//!
//! ## Responsibility
//! Append-only outcome records (one per scanned build) and the filter used
//! to query them.  The filter is a plain value type; each knowledge-base
//! backend translates it into its own query language, and
//! [`StatisticsFilter::matches`] is the reference semantics they must agree
//! with.

use serde::{Deserialize, Serialize};

use super::found::FoundIndication;
use super::result::BuildResult;

/// The build that triggered this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamCause {
    pub project: String,
    pub build: u64,
}

/// One matched cause inside a statistics record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCauseStatistics {
    pub id: String,
    #[serde(default)]
    pub indications: Vec<FoundIndication>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub project_name: String,
    pub build_number: u64,
    #[serde(default)]
    pub display_name: String,
    /// Build start, ms since epoch.
    pub start_time: u64,
    pub duration: u64,
    #[serde(default)]
    pub trigger_causes: Vec<String>,
    pub node_name: String,
    pub master: String,
    #[serde(default)]
    pub time_zone_offset: String,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_cause: Option<UpstreamCause>,
    #[serde(default)]
    pub failure_causes: Vec<FailureCauseStatistics>,
}

impl Statistics {
    pub fn cause_ids(&self) -> Vec<String> {
        self.failure_causes.iter().map(|c| c.id.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// StatisticsFilter
// ---------------------------------------------------------------------------

/// Query over statistics records.  Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsFilter {
    pub project_name: Option<String>,
    /// Empty matches any build number.
    pub build_numbers: Vec<u64>,
    /// Inclusive lower bound on `start_time`.
    pub since: Option<u64>,
    /// Exclusive upper bound on `start_time`.
    pub until: Option<u64>,
    pub result: Option<BuildResult>,
    pub exclude_result: Option<BuildResult>,
    pub master: Option<String>,
    pub node_name: Option<String>,
}

impl StatisticsFilter {
    pub fn project(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn since(mut self, t: u64) -> Self {
        self.since = Some(t);
        self
    }

    pub fn until(mut self, t: u64) -> Self {
        self.until = Some(t);
        self
    }

    pub fn result(mut self, r: BuildResult) -> Self {
        self.result = Some(r);
        self
    }

    pub fn exclude_result(mut self, r: BuildResult) -> Self {
        self.exclude_result = Some(r);
        self
    }

    pub fn matches(&self, s: &Statistics) -> bool {
        if let Some(p) = &self.project_name {
            if &s.project_name != p {
                return false;
            }
        }
        if !self.build_numbers.is_empty() && !self.build_numbers.contains(&s.build_number) {
            return false;
        }
        if let Some(t) = self.since {
            if s.start_time < t {
                return false;
            }
        }
        if let Some(t) = self.until {
            if s.start_time >= t {
                return false;
            }
        }
        if let Some(r) = self.result {
            if s.result != r.to_string() {
                return false;
            }
        }
        if let Some(r) = self.exclude_result {
            if s.result == r.to_string() {
                return false;
            }
        }
        if let Some(m) = &self.master {
            if &s.master != m {
                return false;
            }
        }
        if let Some(n) = &self.node_name {
            if &s.node_name != n {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
pub(crate) fn sample_statistics(project: &str, number: u64, start: u64, result: BuildResult) -> Statistics {
    Statistics {
        project_name: project.to_string(),
        build_number: number,
        display_name: format!("#{number}"),
        start_time: start,
        duration: 1_000,
        trigger_causes: vec!["timer".into()],
        node_name: "agent-1".into(),
        master: "ci".into(),
        time_zone_offset: "+00:00".into(),
        result: result.to_string(),
        upstream_cause: None,
        failure_causes: vec![FailureCauseStatistics {
            id: "c1".into(),
            indications: vec![],
        }],
    }
}
