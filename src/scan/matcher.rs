//! Applies a set of failure causes to one build log.

use tracing::debug;

use super::reader::Scanner;
use crate::model::{BuildRef, FailureCause, FoundFailureCause};

/// Match every live cause against `lines`, in definition order.
///
/// Each indication is scanned once: the first occurrence wins and later
/// occurrences of the same pattern are not recorded.  A cause appears in the
/// result only if at least one of its indications matched.
pub fn match_causes(
    scanner: &Scanner,
    causes: &[FailureCause],
    lines: &[String],
    file: &str,
    build: Option<&BuildRef>,
) -> Vec<FoundFailureCause> {
    let mut found = Vec::new();
    for cause in causes.iter().filter(|c| !c.is_removed()) {
        let mut hits = Vec::new();
        for indication in &cause.indications {
            if let Some(mut f) = scanner.scan(indication, lines, file) {
                if let Some(b) = build {
                    f = f.with_build(b.clone());
                }
                hits.push(f);
            }
        }
        if !hits.is_empty() {
            debug!(cause = %cause.name, matches = hits.len(), "cause matched");
            found.push(FoundFailureCause::new(cause, hits));
        }
    }
    found
}

/// Drop causes carrying a fallback category when anything more specific
/// matched.  If only fallback causes matched, they are all kept.
pub fn apply_fallback_categories(
    found: Vec<FoundFailureCause>,
    fallback_categories: &[String],
) -> Vec<FoundFailureCause> {
    if fallback_categories.is_empty() {
        return found;
    }
    let is_fallback = |c: &FoundFailureCause| fallback_categories.iter().any(|fc| c.has_category(fc));
    if found.iter().all(is_fallback) {
        return found;
    }
    found.into_iter().filter(|c| !is_fallback(c)).collect()
}
