//! # Stage: Failure Cause
//!
//! ## Responsibility
//! The catalog entry: a named, described build-failure category made of
//! indications, plus its bookkeeping (modification history, last occurrence,
//! soft-delete tombstone).
//!
//! ## Guarantees
//! - `id` is assigned once by the knowledge base and never changes
//! - Removal is a tombstone; removed causes stay readable by id
//! - `validate()` is the single gate for user-supplied causes

use serde::{Deserialize, Serialize};

use super::indication::{Indication, ReaderMode};
use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Modification / Tombstone
// ---------------------------------------------------------------------------

/// One entry of a cause's edit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub user: String,
    pub time: u64,
    #[serde(default)]
    pub description: String,
}

/// Soft-delete marker: who removed the cause and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub by: String,
    pub time: u64,
}

// ---------------------------------------------------------------------------
// FailureCause
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureCause {
    /// Empty until the knowledge base assigns one.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub indications: Vec<Indication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_occurred: Option<u64>,
    #[serde(default)]
    pub modifications: Vec<Modification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<Tombstone>,
}

impl FailureCause {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: description.into(),
            comment: String::new(),
            categories: Vec::new(),
            indications: Vec::new(),
            last_occurred: None,
            modifications: Vec::new(),
            removed: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn with_indication(mut self, indication: Indication) -> Self {
        self.indications.push(indication);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Has this cause been persisted yet?
    pub fn is_new(&self) -> bool {
        self.id.is_empty()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.is_some()
    }

    /// True when any indication needs the multi-line reader.
    pub fn is_multi_line(&self) -> bool {
        self.indications
            .iter()
            .any(|i| i.mode() == ReaderMode::MultiLine)
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        Ok(())
    }

    pub fn record_modification(&mut self, user: impl Into<String>, time: u64, description: impl Into<String>) {
        self.modifications.push(Modification {
            user: user.into(),
            time,
            description: description.into(),
        });
    }

    /// Move `last_occurred` forward; never backwards.
    pub fn touch_last_occurred(&mut self, time: u64) -> bool {
        match self.last_occurred {
            Some(t) if t >= time => false,
            _ => {
                self.last_occurred = Some(time);
                true
            }
        }
    }

    pub fn shallow(&self) -> ShallowCause {
        ShallowCause {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            categories: self.categories.clone(),
        }
    }

    pub fn name_only(&self) -> CauseName {
        CauseName {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

/// A cause without its indications or history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShallowCause {
    pub id: String,
    pub name: String,
    pub description: String,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseName {
    pub id: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FailureCause {
        FailureCause::new("OOM", "The JVM ran out of heap")
            .with_category("infra")
            .with_indication(Indication::single_line(".*OutOfMemoryError.*").unwrap())
    }

    #[test]
    fn new_cause_has_no_id() {
        assert!(sample().is_new());
        assert!(!sample().with_id("abc").is_new());
    }

    #[test]
    fn blank_name_is_rejected() {
        let c = FailureCause::new("   ", "d");
        assert_eq!(c.validate(), Err(ValidationError::EmptyName));
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn multi_line_detection() {
        assert!(!sample().is_multi_line());
        let c = sample().with_indication(Indication::multi_line("a\\nb").unwrap());
        assert!(c.is_multi_line());
    }

    #[test]
    fn touch_last_occurred_only_moves_forward() {
        let mut c = sample();
        assert!(c.touch_last_occurred(100));
        assert!(!c.touch_last_occurred(50));
        assert_eq!(c.last_occurred, Some(100));
        assert!(c.touch_last_occurred(200));
        assert_eq!(c.last_occurred, Some(200));
    }

    #[test]
    fn json_shape_is_camel_case() {
        let mut c = sample().with_id("id-1");
        c.last_occurred = Some(7);
        c.removed = Some(Tombstone { by: "alice".into(), time: 9 });
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["lastOccurred"], 7);
        assert_eq!(v["removed"]["by"], "alice");
        assert_eq!(v["indications"][0]["pattern"], ".*OutOfMemoryError.*");
        let back: FailureCause = serde_json::from_value(v).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn minimal_document_deserializes() {
        let c: FailureCause = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert!(c.is_new());
        assert!(c.indications.is_empty());
        assert!(!c.is_removed());
    }

    #[test]
    fn shallow_drops_indications() {
        let s = sample().with_id("i").shallow();
        assert_eq!(s.name, "OOM");
        assert_eq!(s.categories, vec!["infra".to_string()]);
    }
}
