//! Safe/unsafe decision policy.
//!
//! Membership in the configured allow-list is the whole policy: the
//! predicted label is trimmed of surrounding whitespace and compared
//! case-sensitively against the configured safe conditions.

use std::collections::BTreeSet;

use chrono::Utc;
use log::debug;

use allsky_utils::status::Verdict;

use crate::classifier::Classification;

/// The set of sky-condition labels the observatory treats as safe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafeConditionSet {
    conditions: BTreeSet<String>,
}

impl SafeConditionSet {
    /// Parse a comma-separated allow-list, e.g.
    /// `"Clear,Partially Clear,Clear with Moon"`. Entries are trimmed;
    /// case is preserved.
    pub fn parse(raw: &str) -> Self {
        let conditions = raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();
        Self { conditions }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Exact, case-sensitive membership test on the trimmed condition.
    pub fn is_safe(&self, condition: &str) -> bool {
        self.conditions.contains(condition.trim())
    }
}

/// Turn a classification into a publishable verdict.
pub fn decide(classification: &Classification, safe: &SafeConditionSet) -> Verdict {
    let is_safe = safe.is_safe(&classification.label);
    debug!(
        "decision: {} ({:.3}) -> {}",
        classification.label,
        classification.confidence,
        if is_safe { "safe" } else { "unsafe" }
    );
    Verdict {
        is_safe,
        condition: classification.label.clone(),
        confidence: classification.confidence,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_set() -> SafeConditionSet {
        SafeConditionSet::parse("Clear,Partially Clear,Clear with Moon")
    }

    #[test]
    fn listed_condition_is_safe() {
        let verdict = decide(
            &Classification {
                label: "Clear".to_string(),
                confidence: 0.91,
            },
            &default_set(),
        );
        assert!(verdict.is_safe);
        assert_eq!(verdict.condition, "Clear");
        assert_eq!(verdict.confidence, 0.91);
    }

    #[test]
    fn membership_is_case_sensitive() {
        let set = default_set();
        assert!(!set.is_safe("clear"));
        assert!(!set.is_safe("CLEAR"));
        assert!(set.is_safe("Clear"));
    }

    #[test]
    fn unlisted_condition_is_unsafe() {
        let verdict = decide(
            &Classification {
                label: "Cloudy".to_string(),
                confidence: 0.97,
            },
            &default_set(),
        );
        assert!(!verdict.is_safe);
    }

    #[test]
    fn candidate_whitespace_is_trimmed() {
        let set = default_set();
        assert!(set.is_safe(" Clear "));
        assert!(set.is_safe("Clear with Moon"));
    }

    #[test]
    fn parse_trims_entries_and_skips_blanks() {
        let set = SafeConditionSet::parse(" Clear , ,Partially Clear,");
        assert_eq!(set.len(), 2);
        assert!(set.is_safe("Clear"));
        assert!(set.is_safe("Partially Clear"));
    }

    #[test]
    fn empty_list_marks_everything_unsafe() {
        let set = SafeConditionSet::parse("");
        assert!(set.is_empty());
        assert!(!set.is_safe("Clear"));
    }
}
