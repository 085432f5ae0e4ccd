use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::backup::BackupError;
use crate::config::ConfigError;
use crate::conflict::{ConflictError, ConflictReport};
use crate::coordinator::{MergeOperation, MergePhase};
use crate::persistence::PersistenceError;
use crate::provider::{ChangeRequest, ChangeRequestId, ProviderError};
use crate::queue::{QueueError, QueueStatusReport};
use crate::sync::SyncError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("No GitHub token configured; set GITHUB_TOKEN or github.token")]
    MissingToken,
    #[error("Another drain holds {path}")]
    DrainLocked { path: PathBuf },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Overall result of a command, mapped to the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some work done, some skipped or failed
    Partial,
    Failure,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Partial => 2,
            RunStatus::Failure => 1,
        }
    }

    /// The worse of two statuses
    pub fn combine(self, other: RunStatus) -> RunStatus {
        match (self, other) {
            (RunStatus::Failure, _) | (_, RunStatus::Failure) => RunStatus::Failure,
            (RunStatus::Partial, _) | (_, RunStatus::Partial) => RunStatus::Partial,
            _ => RunStatus::Success,
        }
    }
}

/// An open change request together with the resources it touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredChange {
    pub change_request: ChangeRequest,
    pub touched: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    pub changes: Vec<DiscoveredChange>,
    /// Repositories whose listing succeeded
    pub listed_repositories: Vec<String>,
    /// (repository, error)
    pub failed_repositories: Vec<(String, String)>,
    /// Change requests dropped because their resources could not be listed
    pub skipped: Vec<ChangeRequestId>,
}

impl DiscoveryResult {
    pub fn status(&self) -> RunStatus {
        if self.failed_repositories.is_empty() && self.skipped.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Partial
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzedChange {
    pub change_request: ChangeRequest,
    pub report: ConflictReport,
    pub priority: u8,
}

#[derive(Debug, Clone)]
pub struct AnalysisRun {
    pub run_id: String,
    pub discovery: DiscoveryResult,
    pub analyzed: Vec<AnalyzedChange>,
}

impl AnalysisRun {
    pub fn status(&self) -> RunStatus {
        self.discovery.status()
    }

    pub fn change_requests(&self) -> Vec<ChangeRequest> {
        self.analyzed
            .iter()
            .map(|change| change.change_request.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Queued items whose change request is no longer open
    pub removed: Vec<ChangeRequestId>,
}

#[derive(Debug, Clone, Copy)]
pub struct DrainOptions {
    pub max_concurrent: usize,
    /// Select and report without executing; leases are released
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub run_id: String,
    pub dry_run: bool,
    pub selected: Vec<ChangeRequestId>,
    pub operations: Vec<MergeOperation>,
    /// Selected but not attempted
    pub skipped: Vec<ChangeRequestId>,
}

impl DrainReport {
    pub fn merged(&self) -> impl Iterator<Item = &MergeOperation> {
        self.operations.iter().filter(|op| op.succeeded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &MergeOperation> {
        self.operations.iter().filter(|op| !op.succeeded())
    }

    /// Failure when the backup subsystem refused every attempt, partial
    /// when anything failed or was skipped
    pub fn status(&self) -> RunStatus {
        let backup_failures = self
            .operations
            .iter()
            .filter(|op| op.failed_at == Some(MergePhase::BackupCreation))
            .count();
        if backup_failures > 0 && backup_failures == self.operations.len() {
            return RunStatus::Failure;
        }
        if self.failed().next().is_some() || !self.skipped.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Success
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub manual_recovery_required: usize,
    pub last_finished_at: Option<DateTime<Utc>>,
}

impl HistorySummary {
    pub fn from_operations(operations: &[MergeOperation]) -> Self {
        let mut summary = HistorySummary {
            total: operations.len(),
            ..Default::default()
        };
        for op in operations {
            if op.succeeded() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            if op.rollback_performed {
                summary.rolled_back += 1;
            }
            if op.manual_recovery_required {
                summary.manual_recovery_required += 1;
            }
            summary.last_finished_at = summary.last_finished_at.max(op.finished_at);
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub queue: QueueStatusReport,
    pub history: HistorySummary,
}
