//! Barrier synchronization
//!
//! Named rendezvous points where a known set of participants must all arrive
//! before any of them proceeds. Waiters park on a watch channel and wake on
//! either the last arrival or the deadline, whichever comes first. The
//! deadline is fixed when the first participant joins.

pub mod types;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use types::{JoinOutcome, SyncError, SyncPoint, SyncState};

struct SyncPointCell {
    point: SyncPoint,
    deadline: Option<Instant>,
}

struct SyncPointEntry {
    cell: Mutex<SyncPointCell>,
    state_tx: watch::Sender<SyncState>,
}

/// Owns every live sync point
#[derive(Default)]
pub struct BarrierSynchronizer {
    points: Mutex<HashMap<String, Arc<SyncPointEntry>>>,
}

impl BarrierSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_sync_point<I, S>(
        &self,
        id: &str,
        required: I,
        timeout: Duration,
    ) -> Result<SyncPoint, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let required: std::collections::BTreeSet<String> =
            required.into_iter().map(Into::into).collect();
        if required.is_empty() {
            return Err(SyncError::EmptyParticipantSet(id.to_string()));
        }

        let mut points = self.points.lock().await;
        if points.contains_key(id) {
            return Err(SyncError::DuplicateSyncPoint(id.to_string()));
        }

        let point = SyncPoint {
            id: id.to_string(),
            required,
            joined: Default::default(),
            state: SyncState::Ready,
            timeout,
            started_at: None,
            completed_at: None,
            diagnostic: None,
        };
        let (state_tx, _) = watch::channel(SyncState::Ready);
        points.insert(
            id.to_string(),
            Arc::new(SyncPointEntry {
                cell: Mutex::new(SyncPointCell {
                    point: point.clone(),
                    deadline: None,
                }),
                state_tx,
            }),
        );

        debug!(
            sync_point = %id,
            participants = point.required.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Sync point created"
        );
        Ok(point)
    }

    /// Arrive at `id` as `participant` and wait for the rendezvous to resolve
    pub async fn join(&self, id: &str, participant: &str) -> Result<JoinOutcome, SyncError> {
        let entry = self.entry(id).await?;

        let (deadline, mut state_rx) = {
            let mut cell = entry.cell.lock().await;
            if !cell.point.required.contains(participant) {
                return Err(SyncError::UnregisteredParticipant {
                    sync_point: id.to_string(),
                    participant: participant.to_string(),
                });
            }

            match cell.point.state {
                SyncState::Completed | SyncState::Error => return Ok(outcome(&cell.point)),
                SyncState::Ready => {
                    let now = Instant::now();
                    cell.point.state = SyncState::Syncing;
                    cell.point.started_at = Some(Utc::now());
                    cell.deadline = Some(now + cell.point.timeout);
                    entry.state_tx.send_replace(SyncState::Syncing);
                    info!(sync_point = %id, first = %participant, "Sync point syncing");
                }
                SyncState::Syncing => {}
            }

            let timeout = cell.point.timeout;
            let deadline = *cell.deadline.get_or_insert_with(|| Instant::now() + timeout);
            if Instant::now() >= deadline {
                fail(&mut cell, &entry.state_tx);
                return Ok(outcome(&cell.point));
            }

            cell.point.joined.insert(participant.to_string());
            debug!(
                sync_point = %id,
                participant = %participant,
                joined = cell.point.joined.len(),
                required = cell.point.required.len(),
                "Participant joined"
            );

            if cell.point.joined == cell.point.required {
                cell.point.state = SyncState::Completed;
                cell.point.completed_at = Some(Utc::now());
                entry.state_tx.send_replace(SyncState::Completed);
                info!(sync_point = %id, "Sync point completed");
                return Ok(outcome(&cell.point));
            }

            (deadline, entry.state_tx.subscribe())
        };

        let timed_out = tokio::time::timeout_at(deadline, state_rx.wait_for(|s| s.is_terminal()))
            .await
            .is_err();

        let mut cell = entry.cell.lock().await;
        if timed_out && cell.point.state == SyncState::Syncing {
            fail(&mut cell, &entry.state_tx);
        }
        Ok(outcome(&cell.point))
    }

    /// Non-blocking snapshot
    pub async fn status(&self, id: &str) -> Result<SyncPoint, SyncError> {
        let entry = self.entry(id).await?;
        let cell = entry.cell.lock().await;
        Ok(cell.point.clone())
    }

    /// Remove a terminal sync point. Live points are left alone.
    pub async fn cleanup(&self, id: &str) -> Result<bool, SyncError> {
        let mut points = self.points.lock().await;
        let entry = points
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownSyncPoint(id.to_string()))?;

        let state = entry.cell.lock().await.point.state;
        if !state.is_terminal() {
            warn!(sync_point = %id, state = ?state, "Refusing to clean up live sync point");
            return Ok(false);
        }

        points.remove(id);
        debug!(sync_point = %id, "Sync point removed");
        Ok(true)
    }

    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.points.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn entry(&self, id: &str) -> Result<Arc<SyncPointEntry>, SyncError> {
        self.points
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownSyncPoint(id.to_string()))
    }
}

fn fail(cell: &mut SyncPointCell, state_tx: &watch::Sender<SyncState>) {
    let missing = cell.point.missing().join(", ");
    let diagnostic = format!(
        "Sync point '{}' timed out after {:?}; missing participants: {}",
        cell.point.id, cell.point.timeout, missing
    );
    warn!(sync_point = %cell.point.id, missing = %missing, "Sync point timed out");
    cell.point.state = SyncState::Error;
    cell.point.diagnostic = Some(diagnostic);
    state_tx.send_replace(SyncState::Error);
}

fn outcome(point: &SyncPoint) -> JoinOutcome {
    JoinOutcome {
        sync_point: point.id.clone(),
        success: point.state == SyncState::Completed,
        diagnostic: point.diagnostic.clone(),
    }
}
