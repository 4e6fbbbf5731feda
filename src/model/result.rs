use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a completed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
}

impl BuildResult {
    /// Should a build with this result be scanned for failure causes?
    pub fn need_to_analyze(self, skip_aborted: bool) -> bool {
        match self {
            BuildResult::Success => false,
            BuildResult::Aborted => !skip_aborted,
            _ => true,
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildResult::Success => write!(f, "SUCCESS"),
            BuildResult::Unstable => write!(f, "UNSTABLE"),
            BuildResult::Failure => write!(f, "FAILURE"),
            BuildResult::NotBuilt => write!(f, "NOT_BUILT"),
            BuildResult::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl std::str::FromStr for BuildResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(BuildResult::Success),
            "UNSTABLE" => Ok(BuildResult::Unstable),
            "FAILURE" => Ok(BuildResult::Failure),
            "NOT_BUILT" => Ok(BuildResult::NotBuilt),
            "ABORTED" => Ok(BuildResult::Aborted),
            _ => Err(format!("Unknown build result: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BuildResult::Success, false, false)]
    #[case(BuildResult::Failure, false, true)]
    #[case(BuildResult::Unstable, false, true)]
    #[case(BuildResult::NotBuilt, true, true)]
    #[case(BuildResult::Aborted, false, true)]
    #[case(BuildResult::Aborted, true, false)]
    fn need_to_analyze_table(#[case] r: BuildResult, #[case] skip_aborted: bool, #[case] want: bool) {
        assert_eq!(r.need_to_analyze(skip_aborted), want);
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for r in [
            BuildResult::Success,
            BuildResult::Unstable,
            BuildResult::Failure,
            BuildResult::NotBuilt,
            BuildResult::Aborted,
        ] {
            assert_eq!(r.to_string().parse::<BuildResult>().unwrap(), r);
        }
    }

    #[test]
    fn from_str_rejects_unknown() {
        assert!("GREEN".parse::<BuildResult>().is_err());
    }
}
