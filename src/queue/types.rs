use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::conflict::{ConflictReport, Severity};
use crate::persistence::PersistenceError;
use crate::provider::{ChangeRequest, ChangeRequestId, MergeMethod};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    #[default]
    Unknown,
    Clean,
    AutoResolvable,
    /// Skipped by scheduling until cleared by an operator
    ManualRequired,
}

impl ConflictStatus {
    pub fn from_report(report: &ConflictReport) -> Self {
        if report.severity == Severity::Unknown {
            ConflictStatus::Unknown
        } else if !report.has_conflicts() {
            ConflictStatus::Clean
        } else if report.auto_resolvable {
            ConflictStatus::AutoResolvable
        } else {
            ConflictStatus::ManualRequired
        }
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConflictStatus::Unknown => "unknown",
            ConflictStatus::Clean => "clean",
            ConflictStatus::AutoResolvable => "auto_resolvable",
            ConflictStatus::ManualRequired => "manual_required",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ChangeRequestId,
    pub source_branch: String,
    pub target_branch: String,
    /// 1..=10, higher merges first
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub dependencies: Vec<ChangeRequestId>,
    #[serde(default)]
    pub merge_method: MergeMethod,
    pub estimated_minutes: u32,
    #[serde(default)]
    pub gates_passed: bool,
    #[serde(default)]
    pub conflict_status: ConflictStatus,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn from_analysis(
        change_request: &ChangeRequest,
        report: &ConflictReport,
        priority: u8,
        merge_method: MergeMethod,
    ) -> Self {
        Self {
            id: change_request.id.clone(),
            source_branch: change_request.source_branch.clone(),
            target_branch: change_request.target_branch.clone(),
            priority,
            created_at: change_request.created_at,
            dependencies: report.dependencies.clone(),
            merge_method,
            estimated_minutes: report.estimated_resolution_minutes,
            gates_passed: false,
            conflict_status: ConflictStatus::from_report(report),
            failure_count: 0,
            last_error: None,
        }
    }

    pub fn is_manual_required(&self) -> bool {
        self.conflict_status == ConflictStatus::ManualRequired
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Success,
    Failure { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatusReport {
    pub total: usize,
    pub leased: usize,
    pub by_conflict_status: BTreeMap<ConflictStatus, usize>,
    pub by_priority: BTreeMap<u8, usize>,
    pub by_repository: BTreeMap<String, usize>,
    pub window_open: bool,
    pub next_window_opening: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Change request {0} is not queued")]
    NotFound(ChangeRequestId),
    #[error("Priority {priority} for {id} is outside 1..=10")]
    InvalidPriority { id: ChangeRequestId, priority: u8 },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
