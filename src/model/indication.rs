//! # Stage: Indication
//!
//! ## Responsibility
//! A user-authored pattern plus the reader mode it is evaluated in.  The
//! pattern is compiled once, at construction or deserialization, into the
//! wrapped form the scanner needs:
//!
//! - `SingleLine`: `^(?:p)$`, so the pattern must cover a whole log line
//! - `MultiLine`: `(?ms)^[^\r\n]*?(?:p)[^\r\n]*?$`, so a match spanning
//!   several lines expands to whole lines on both ends
//!
//! ## Guarantees
//! - An `Indication` value always holds a compiled pattern; invalid
//!   expressions are rejected with `ValidationError::InvalidPattern`
//! - Compilation is size-limited so hostile patterns cannot exhaust memory
//! - Only the user-authored text and mode are persisted

use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Upper bound on compiled program size for a single indication.
const PATTERN_SIZE_LIMIT: usize = 2 * (1 << 20);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReaderMode {
    #[default]
    SingleLine,
    MultiLine,
}

impl fmt::Display for ReaderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderMode::SingleLine => write!(f, "single-line"),
            ReaderMode::MultiLine => write!(f, "multi-line"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "IndicationSerde", into = "IndicationSerde")]
pub struct Indication {
    pattern: String,
    mode: ReaderMode,
    compiled: Regex,
}

#[derive(Serialize, Deserialize)]
struct IndicationSerde {
    pattern: String,
    #[serde(default)]
    mode: ReaderMode,
}

impl TryFrom<IndicationSerde> for Indication {
    type Error = ValidationError;

    fn try_from(s: IndicationSerde) -> Result<Self, Self::Error> {
        Indication::new(s.pattern, s.mode)
    }
}

impl From<Indication> for IndicationSerde {
    fn from(i: Indication) -> Self {
        Self {
            pattern: i.pattern,
            mode: i.mode,
        }
    }
}

impl Indication {
    pub fn new(pattern: impl Into<String>, mode: ReaderMode) -> Result<Self, ValidationError> {
        let pattern = pattern.into();
        let wrapped = match mode {
            ReaderMode::SingleLine => format!("^(?:{pattern})$"),
            ReaderMode::MultiLine => format!("(?ms)^[^\\r\\n]*?(?:{pattern})[^\\r\\n]*?$"),
        };
        let compiled = RegexBuilder::new(&wrapped)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| ValidationError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            pattern,
            mode,
            compiled,
        })
    }

    pub fn single_line(pattern: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(pattern, ReaderMode::SingleLine)
    }

    pub fn multi_line(pattern: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(pattern, ReaderMode::MultiLine)
    }

    /// The user-authored expression.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn mode(&self) -> ReaderMode {
        self.mode
    }

    /// The wrapped, compiled expression the scanner evaluates.
    pub fn compiled(&self) -> &Regex {
        &self.compiled
    }
}

impl PartialEq for Indication {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.mode == other.mode
    }
}

impl Eq for Indication {}

impl fmt::Debug for Indication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Indication")
            .field("pattern", &self.pattern)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_must_match_whole_line() {
        let i = Indication::single_line("ERROR.*").unwrap();
        assert!(i.compiled().is_match("ERROR: compilation failed"));
        assert!(!i.compiled().is_match("[main] ERROR: compilation failed"));
    }

    #[test]
    fn single_line_alternation_is_grouped() {
        let i = Indication::single_line("foo|bar").unwrap();
        assert!(i.compiled().is_match("bar"));
        assert!(!i.compiled().is_match("foobaz"));
    }

    #[test]
    fn multi_line_expands_to_whole_lines() {
        let i = Indication::multi_line("first\\nsecond").unwrap();
        let text = "noise\nxx first\nsecond yy\ntail";
        let m = i.compiled().find(text).unwrap();
        assert_eq!(m.as_str(), "xx first\nsecond yy");
    }

    #[test]
    fn invalid_pattern_is_validation_error() {
        let err = Indication::single_line("(unclosed").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPattern { .. }));
    }

    #[test]
    fn serde_persists_user_pattern_only() {
        let i = Indication::multi_line("a.b").unwrap();
        let json = serde_json::to_string(&i).unwrap();
        assert_eq!(json, r#"{"pattern":"a.b","mode":"multiLine"}"#);
        let back: Indication = serde_json::from_str(&json).unwrap();
        assert_eq!(back, i);
    }

    #[test]
    fn deserialize_defaults_to_single_line() {
        let i: Indication = serde_json::from_str(r#"{"pattern":"x"}"#).unwrap();
        assert_eq!(i.mode(), ReaderMode::SingleLine);
    }

    #[test]
    fn deserialize_rejects_bad_pattern() {
        assert!(serde_json::from_str::<Indication>(r#"{"pattern":"["}"#).is_err());
    }
}
