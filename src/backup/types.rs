use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMethod {
    /// Backup branch at HEAD, restored with a hard reset
    FullHistory,
    /// Copy of the essential files under the state directory
    FileCopy,
}

impl fmt::Display for BackupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMethod::FullHistory => write!(f, "full_history"),
            BackupMethod::FileCopy => write!(f, "file_copy"),
        }
    }
}

/// Repository state captured before an operation touches anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStatus {
    pub head: Option<String>,
    pub branch: Option<String>,
    pub dirty_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHandle {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Working tree the backup was taken from
    #[serde(default)]
    pub repository: PathBuf,
    /// Backup ref name or file-copy directory
    pub location: String,
    pub method: BackupMethod,
    pub status: RepositoryStatus,
    pub host: String,
    /// Filled in once a restore succeeds
    pub restore_method: Option<BackupMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub success: bool,
    pub method: Option<BackupMethod>,
    pub errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup unavailable: {0}")]
    BackupUnavailable(String),
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid essential pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
