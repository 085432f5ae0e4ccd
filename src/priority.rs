use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::provider::ChangeRequest;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
const BASE_PRIORITY: u8 = 5;
const MAX_AGE_BONUS: i64 = 2;

pub fn default_priority_weights() -> BTreeMap<String, u8> {
    BTreeMap::from([
        ("hotfix".to_string(), 10),
        ("security".to_string(), 9),
        ("bugfix".to_string(), 7),
        ("feature".to_string(), 5),
        ("documentation".to_string(), 3),
    ])
}

/// Scores change requests on the 1..=10 queue priority scale
#[derive(Debug, Clone)]
pub struct PriorityCalculator {
    weights: BTreeMap<String, u8>,
    maintainers: BTreeSet<String>,
}

impl Default for PriorityCalculator {
    fn default() -> Self {
        Self::new(&default_priority_weights(), &[])
    }
}

impl PriorityCalculator {
    /// Label and maintainer matching is case-insensitive
    pub fn new(weights: &BTreeMap<String, u8>, maintainers: &[String]) -> Self {
        Self {
            weights: weights
                .iter()
                .map(|(label, weight)| (label.to_lowercase(), *weight))
                .collect(),
            maintainers: maintainers.iter().map(|m| m.to_lowercase()).collect(),
        }
    }

    /// Base 5, raised to the heaviest matching label, plus one per week of
    /// age (at most two) and one for a maintainer author
    pub fn priority(&self, change_request: &ChangeRequest, now: DateTime<Utc>) -> u8 {
        let label_weight = change_request
            .labels
            .iter()
            .filter_map(|label| self.weights.get(&label.to_lowercase()).copied())
            .max()
            .unwrap_or(0);
        let base = BASE_PRIORITY.max(label_weight);

        let age_bonus = (change_request.age_days(now) / 7).clamp(0, MAX_AGE_BONUS) as u8;
        let maintainer_bonus = u8::from(
            self.maintainers
                .contains(&change_request.author.to_lowercase()),
        );

        base.saturating_add(age_bonus)
            .saturating_add(maintainer_bonus)
            .clamp(MIN_PRIORITY, MAX_PRIORITY)
    }
}

/// Coarse band used when displaying queue contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityBand {
    Low,
    Normal,
    High,
    Urgent,
}

impl PriorityBand {
    pub fn from_score(score: u8) -> Self {
        match score {
            9.. => PriorityBand::Urgent,
            7..=8 => PriorityBand::High,
            4..=6 => PriorityBand::Normal,
            _ => PriorityBand::Low,
        }
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PriorityBand::Urgent => "URGENT",
            PriorityBand::High => "HIGH",
            PriorityBand::Normal => "NORMAL",
            PriorityBand::Low => "LOW",
        };
        write!(f, "{}", label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChangeRequestId;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn change_request(labels: &[&str], author: &str, age_days: i64) -> ChangeRequest {
        ChangeRequest {
            id: ChangeRequestId::new("acme/widgets", 1),
            title: "Change".to_string(),
            description: String::new(),
            source_branch: "feature".to_string(),
            target_branch: "main".to_string(),
            author: author.to_string(),
            created_at: now() - chrono::Duration::days(age_days),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            mergeable: None,
        }
    }

    #[test]
    fn test_unlabelled_fresh_request_gets_base_priority() {
        let calc = PriorityCalculator::default();
        assert_eq!(calc.priority(&change_request(&[], "dev", 0), now()), 5);
    }

    #[test]
    fn test_label_weights_raise_but_never_lower_the_base() {
        let calc = PriorityCalculator::default();
        assert_eq!(calc.priority(&change_request(&["bugfix"], "dev", 0), now()), 7);
        assert_eq!(calc.priority(&change_request(&["Documentation"], "dev", 0), now()), 5);
        // Heaviest label wins
        assert_eq!(
            calc.priority(&change_request(&["feature", "security"], "dev", 0), now()),
            9
        );
    }

    #[test]
    fn test_age_bonus_caps_at_two() {
        let calc = PriorityCalculator::default();
        assert_eq!(calc.priority(&change_request(&[], "dev", 6), now()), 5);
        assert_eq!(calc.priority(&change_request(&[], "dev", 7), now()), 6);
        assert_eq!(calc.priority(&change_request(&[], "dev", 14), now()), 7);
        assert_eq!(calc.priority(&change_request(&[], "dev", 90), now()), 7);
    }

    #[test]
    fn test_maintainer_bonus_and_clamp() {
        let calc = PriorityCalculator::new(&default_priority_weights(), &["Alice".to_string()]);
        assert_eq!(calc.priority(&change_request(&[], "alice", 0), now()), 6);
        assert_eq!(calc.priority(&change_request(&["hotfix"], "alice", 30), now()), 10);
    }

    #[test]
    fn test_priority_band_display() {
        assert_eq!(PriorityBand::from_score(10).to_string(), "URGENT");
        assert_eq!(PriorityBand::from_score(7).to_string(), "HIGH");
        assert_eq!(PriorityBand::from_score(5).to_string(), "NORMAL");
        assert_eq!(PriorityBand::from_score(1).to_string(), "LOW");
        assert!(PriorityBand::Urgent > PriorityBand::High);
    }
}
