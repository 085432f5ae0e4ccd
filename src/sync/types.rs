use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle of a sync point. Only ever moves forward:
/// Ready -> Syncing -> {Completed, Error}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Ready,
    Syncing,
    Completed,
    Error,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncState::Completed | SyncState::Error)
    }
}

/// Snapshot of a named rendezvous point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub id: String,
    pub required: BTreeSet<String>,
    pub joined: BTreeSet<String>,
    pub state: SyncState,
    pub timeout: Duration,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once, when the point fails
    pub diagnostic: Option<String>,
}

impl SyncPoint {
    pub fn missing(&self) -> Vec<&str> {
        self.required
            .difference(&self.joined)
            .map(String::as_str)
            .collect()
    }
}

/// What a participant learns when `join` returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub sync_point: String,
    pub success: bool,
    pub diagnostic: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Sync point '{0}' already exists")]
    DuplicateSyncPoint(String),
    #[error("Sync point '{0}' does not exist")]
    UnknownSyncPoint(String),
    #[error("Participant '{participant}' is not registered for sync point '{sync_point}'")]
    UnregisteredParticipant {
        sync_point: String,
        participant: String,
    },
    #[error("Sync point '{0}' has no required participants")]
    EmptyParticipantSet(String),
}
