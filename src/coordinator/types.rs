use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::backup::BackupHandle;
use crate::gates::QualityGateResult;
use crate::provider::ChangeRequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePhase {
    BackupCreation,
    PreMergeGates,
    ConflictDetection,
    ConflictResolution,
    MergeExecution,
    PostMergeGates,
    Complete,
    Failed,
}

impl MergePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, MergePhase::Complete | MergePhase::Failed)
    }
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergePhase::BackupCreation => "backup_creation",
            MergePhase::PreMergeGates => "pre_merge_gates",
            MergePhase::ConflictDetection => "conflict_detection",
            MergePhase::ConflictResolution => "conflict_resolution",
            MergePhase::MergeExecution => "merge_execution",
            MergePhase::PostMergeGates => "post_merge_gates",
            MergePhase::Complete => "complete",
            MergePhase::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// One attempt to merge one change request. Appended to history once
/// terminal and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOperation {
    pub id: Uuid,
    pub change_request: ChangeRequestId,
    pub source_branch: String,
    pub target_branch: String,
    pub phase: MergePhase,
    pub failed_at: Option<MergePhase>,
    pub backup: Option<BackupHandle>,
    pub pre_merge_results: Vec<QualityGateResult>,
    pub post_merge_results: Vec<QualityGateResult>,
    pub conflict_detected: bool,
    pub conflict_resolved: bool,
    pub resolved_resources: Vec<String>,
    /// Resolution commit published to the source branch
    #[serde(default)]
    pub resolution_sha: Option<String>,
    pub merge_completed: bool,
    pub merge_sha: Option<String>,
    /// Revert commit published to the target branch by a rollback
    #[serde(default)]
    pub revert_sha: Option<String>,
    /// A rollback was attempted
    pub rollback_performed: bool,
    pub rollback_failed: bool,
    pub manual_recovery_required: bool,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MergeOperation {
    pub fn new(change_request: ChangeRequestId, source_branch: &str, target_branch: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            change_request,
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            phase: MergePhase::BackupCreation,
            failed_at: None,
            backup: None,
            pre_merge_results: Vec::new(),
            post_merge_results: Vec::new(),
            conflict_detected: false,
            conflict_resolved: false,
            resolved_resources: Vec::new(),
            resolution_sha: None,
            merge_completed: false,
            merge_sha: None,
            revert_sha: None,
            rollback_performed: false,
            rollback_failed: false,
            manual_recovery_required: false,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn enter(&mut self, phase: MergePhase) {
        self.phase = phase;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.failed_at = Some(self.phase);
        self.phase = MergePhase::Failed;
        self.errors.push(error.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.phase = MergePhase::Complete;
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.phase == MergePhase::Complete
    }

    /// One-line reason for a failed operation
    pub fn failure_summary(&self) -> String {
        let phase = self.failed_at.unwrap_or(self.phase);
        match self.errors.first() {
            Some(error) => format!("{phase}: {error}"),
            None => phase.to_string(),
        }
    }
}
