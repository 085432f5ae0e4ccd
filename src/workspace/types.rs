use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::provider::ChangeRequestId;

/// A private worktree owned by one merge operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMerge {
    pub operation: Uuid,
    pub change_request: ChangeRequestId,
    /// Checkout that gates, snapshots and conflict edits run in
    pub dir: PathBuf,
    /// Worktree name registered with the clone
    pub worktree: String,
    /// Private branch checked out in the worktree
    pub branch: String,
    pub source_branch: String,
    pub target_branch: String,
    /// Source tip the pre-merge gates ran against
    pub source_sha: String,
}

/// Result of merging the source into the target inside the worktree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMerge {
    /// Paths left with conflict markers
    pub conflicted: Vec<String>,
    /// The target already contains the source
    pub up_to_date: bool,
}

impl LocalMerge {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicted.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Repository unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },
    #[error("Conflicts remain in {}", .0.join(", "))]
    UnresolvedConflicts(Vec<String>),
    #[error("Reverting {sha} conflicts with later changes on {branch}")]
    RevertConflict { sha: String, branch: String },
    #[error("Workspace task failed: {0}")]
    Task(String),
}
