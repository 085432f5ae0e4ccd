use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifies a change request as `repository#number`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeRequestId {
    pub repository: String,
    pub number: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid change request id '{input}': expected repository#number")]
pub struct ParseIdError {
    pub input: String,
}

impl ChangeRequestId {
    pub fn new(repository: impl Into<String>, number: u64) -> Self {
        Self {
            repository: repository.into(),
            number,
        }
    }

    /// Cache and queue key, `owner/repo#42`
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChangeRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository, self.number)
    }
}

impl FromStr for ChangeRequestId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIdError {
            input: s.to_string(),
        };
        let (repository, number) = s.rsplit_once('#').ok_or_else(err)?;
        if repository.is_empty() {
            return Err(err());
        }
        let number = number.parse::<u64>().map_err(|_| err())?;
        Ok(Self::new(repository, number))
    }
}

impl TryFrom<String> for ChangeRequestId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChangeRequestId> for String {
    fn from(id: ChangeRequestId) -> Self {
        id.to_string()
    }
}

/// An open change request as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: ChangeRequestId,
    pub title: String,
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub labels: Vec<String>,
    /// Provider's own mergeability hint, when it has computed one
    pub mergeable: Option<bool>,
}

impl ChangeRequest {
    /// Whole days since the request was opened
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// Latest-review-per-reviewer summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewState {
    pub approvals: usize,
    pub changes_requested: usize,
}

impl ReviewState {
    pub fn is_approved(&self) -> bool {
        self.approvals > 0 && self.changes_requested == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    #[default]
    Squash,
    Rebase,
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReceipt {
    pub merged: bool,
    pub sha: Option<String>,
}
