use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::provider::ChangeRequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
    /// Conflict source was unavailable; needs a human
    Unknown,
}

impl Severity {
    /// Tier for `count` conflicting resources. A count equal to a threshold
    /// belongs to that threshold's tier.
    pub fn classify(count: usize, thresholds: &SeverityThresholds) -> Self {
        match count {
            0 => Severity::None,
            n if n <= thresholds.low => Severity::Low,
            n if n <= thresholds.medium => Severity::Medium,
            n if n <= thresholds.high => Severity::High,
            _ => Severity::Critical,
        }
    }

    pub fn permits_auto_resolution(self) -> bool {
        matches!(self, Severity::None | Severity::Low | Severity::Medium)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Unknown => "unknown",
        };
        write!(f, "{label}")
    }
}

/// Upper bounds (inclusive) for each tier. `critical` is recorded for
/// completeness; anything above `high` is critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            low: 5,
            medium: 15,
            high: 30,
            critical: 50,
        }
    }
}

impl SeverityThresholds {
    pub fn is_ascending(&self) -> bool {
        self.low < self.medium && self.medium < self.high && self.high < self.critical
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Documentation,
    Configuration,
    Test,
    Code,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceClass::Documentation => "documentation",
            ResourceClass::Configuration => "configuration",
            ResourceClass::Test => "test",
            ResourceClass::Code => "code",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    AutoMerge,
    PreferIncoming,
    PreferCurrent,
    MergeBoth,
    PrioritizeIncoming,
    PreferMostRecent,
    /// Keep whichever side of each block is longer. Unverified for code.
    LongestSide,
    RequireManual,
}

impl ResolutionStrategy {
    pub fn is_manual(self) -> bool {
        self == ResolutionStrategy::RequireManual
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionStrategy::AutoMerge => "auto_merge",
            ResolutionStrategy::PreferIncoming => "prefer_incoming",
            ResolutionStrategy::PreferCurrent => "prefer_current",
            ResolutionStrategy::MergeBoth => "merge_both",
            ResolutionStrategy::PrioritizeIncoming => "prioritize_incoming",
            ResolutionStrategy::PreferMostRecent => "prefer_most_recent",
            ResolutionStrategy::LongestSide => "longest_side",
            ResolutionStrategy::RequireManual => "require_manual",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ConflictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_merge" => Ok(Self::AutoMerge),
            "prefer_incoming" => Ok(Self::PreferIncoming),
            "prefer_current" => Ok(Self::PreferCurrent),
            "merge_both" => Ok(Self::MergeBoth),
            "prioritize_incoming" => Ok(Self::PrioritizeIncoming),
            "prefer_most_recent" => Ok(Self::PreferMostRecent),
            "longest_side" | "auto" => Ok(Self::LongestSide),
            "require_manual" => Ok(Self::RequireManual),
            other => Err(ConflictError::UnknownStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub change_request: ChangeRequestId,
    pub source_branch: String,
    pub target_branch: String,
    pub conflicting_resources: Vec<String>,
    pub severity: Severity,
    pub auto_resolvable: bool,
    pub resolution_strategy: ResolutionStrategy,
    pub estimated_resolution_minutes: u32,
    pub dependencies: Vec<ChangeRequestId>,
    pub analyzed_at: DateTime<Utc>,
    /// Why the analysis degraded, when it did
    pub analysis_error: Option<String>,
}

impl ConflictReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicting_resources.is_empty()
    }

    /// True when a human has to look at this before it can merge
    pub fn requires_manual(&self) -> bool {
        self.severity == Severity::Unknown || (self.has_conflicts() && !self.auto_resolvable)
    }
}

/// A conflicted resource's content, markers included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictedResource {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResource {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("Conflict source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot resolve {resource} automatically: {reason}")]
    UnresolvableConflict { resource: String, reason: String },
    #[error("Unknown resolution strategy '{0}'")]
    UnknownStrategy(String),
    #[error("Invalid resource class pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
