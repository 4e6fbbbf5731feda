//! Match results attached to a build.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use super::build::BuildRef;
use super::cause::FailureCause;

// ---------------------------------------------------------------------------
// FoundIndication
// ---------------------------------------------------------------------------

/// Where and how one indication matched in one build.
///
/// Records written by current scanners carry `matching_string` and its
/// hash.  Legacy records carry only `matching_line`; the migration workers
/// fill in the string from the log via [`FoundIndication::convert_from_line_number`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundIndication {
    pub pattern: String,
    pub matching_file: String,
    /// 1-based line number of the first matching line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildRef>,
}

impl FoundIndication {
    pub fn new(
        pattern: impl Into<String>,
        matching_file: impl Into<String>,
        matching_line: usize,
        matching_string: impl Into<String>,
    ) -> Self {
        let matching_string = matching_string.into();
        Self {
            pattern: pattern.into(),
            matching_file: matching_file.into(),
            matching_line: Some(matching_line),
            matching_hash: Some(content_hash(&matching_string)),
            matching_string: Some(matching_string),
            build: None,
        }
    }

    /// A record in the legacy shape: line number only.
    pub fn legacy(pattern: impl Into<String>, matching_file: impl Into<String>, line: usize) -> Self {
        Self {
            pattern: pattern.into(),
            matching_file: matching_file.into(),
            matching_line: Some(line),
            matching_string: None,
            matching_hash: None,
            build: None,
        }
    }

    pub fn with_build(mut self, build: BuildRef) -> Self {
        self.build = Some(build);
        self
    }

    pub fn needs_conversion(&self) -> bool {
        self.matching_string.is_none() && self.matching_line.is_some()
    }

    /// Fill `matching_string` (and its hash) from the stored line number.
    ///
    /// Returns `false` when there is nothing to convert or the log is
    /// shorter than the recorded line.
    pub fn convert_from_line_number(&mut self, log: &[String]) -> bool {
        if !self.needs_conversion() {
            return false;
        }
        let Some(line) = self.matching_line else {
            return false;
        };
        let idx = line.saturating_sub(1);
        match log.get(idx) {
            Some(text) => {
                self.matching_hash = Some(content_hash(text));
                self.matching_string = Some(text.clone());
                true
            }
            None => false,
        }
    }
}

/// Hex SHA-1 of the matched content.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// FoundFailureCause
// ---------------------------------------------------------------------------

/// Snapshot of a cause at match time plus the indications that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundFailureCause {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub indications: Vec<FoundIndication>,
}

impl FoundFailureCause {
    pub fn new(cause: &FailureCause, indications: Vec<FoundIndication>) -> Self {
        Self {
            id: cause.id.clone(),
            name: cause.name.clone(),
            description: cause.description.clone(),
            categories: cause.categories.clone(),
            indications,
        }
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> Vec<String> {
        vec!["first".into(), "second".into(), "third".into()]
    }

    #[test]
    fn content_hash_is_hex_sha1() {
        assert_eq!(content_hash("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn new_sets_hash_from_string() {
        let f = FoundIndication::new("p", "log", 2, "second");
        assert_eq!(f.matching_hash.as_deref(), Some(content_hash("second").as_str()));
        assert!(!f.needs_conversion());
    }

    #[test]
    fn convert_from_line_number_reads_one_based_line() {
        let mut f = FoundIndication::legacy("p", "log", 2);
        assert!(f.convert_from_line_number(&log()));
        assert_eq!(f.matching_string.as_deref(), Some("second"));
        assert!(f.matching_hash.is_some());
    }

    #[test]
    fn convert_line_zero_reads_first_line() {
        let mut f = FoundIndication::legacy("p", "log", 0);
        assert!(f.convert_from_line_number(&log()));
        assert_eq!(f.matching_string.as_deref(), Some("first"));
    }

    #[test]
    fn convert_past_end_is_noop() {
        let mut f = FoundIndication::legacy("p", "log", 10);
        assert!(!f.convert_from_line_number(&log()));
        assert!(f.matching_string.is_none());
    }

    #[test]
    fn convert_is_idempotent() {
        let mut f = FoundIndication::legacy("p", "log", 1);
        assert!(f.convert_from_line_number(&log()));
        assert!(!f.convert_from_line_number(&log()));
    }

    #[test]
    fn found_cause_snapshots_cause_fields() {
        let c = FailureCause::new("n", "d").with_id("x").with_category("c");
        let f = FoundFailureCause::new(&c, vec![]);
        assert_eq!(f.id, "x");
        assert!(f.has_category("c"));
    }
}
