//! Merge queue scheduler
//!
//! A single priority-ordered queue shared by every drain. Selection and
//! leasing happen under one lock so two concurrent drains can never pick the
//! same item.

pub mod types;

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::merge_window::MergeWindow;
use crate::persistence::JsonStore;
use crate::priority::{MAX_PRIORITY, MIN_PRIORITY};
use crate::provider::ChangeRequestId;

pub use types::{
    ConflictStatus, EnqueueOutcome, MergeOutcome, QueueError, QueueItem, QueueStatusReport,
};

#[derive(Default)]
struct QueueState {
    items: Vec<QueueItem>,
    leased: HashSet<ChangeRequestId>,
}

impl QueueState {
    fn sort(&mut self) {
        // Stable: equal keys keep insertion order
        self.items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
    }

    fn position(&self, id: &ChangeRequestId) -> Option<usize> {
        self.items.iter().position(|item| &item.id == id)
    }
}

pub struct MergeQueue {
    state: Mutex<QueueState>,
    window: MergeWindow,
    store: Option<JsonStore<Vec<QueueItem>>>,
}

impl MergeQueue {
    pub fn new(window: MergeWindow) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            window,
            store: None,
        }
    }

    /// Persist every mutation to `queue.json` at `path`
    pub fn with_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = Some(JsonStore::new(path));
        self
    }

    pub fn window(&self) -> &MergeWindow {
        &self.window
    }

    /// Replace in-memory contents with the persisted queue. Leases are not
    /// persisted; a crashed drain's items become selectable again.
    pub async fn load(&self) -> Result<usize, QueueError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let items = store.load().await?.unwrap_or_default();
        let mut state = self.state.lock().await;
        state.items = items;
        state.leased.clear();
        state.sort();
        info!(items = state.items.len(), "Merge queue loaded");
        Ok(state.items.len())
    }

    /// Insert or update in place, then re-sort by priority desc, created_at asc
    pub async fn enqueue(&self, item: QueueItem) -> Result<EnqueueOutcome, QueueError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&item.priority) {
            return Err(QueueError::InvalidPriority {
                id: item.id,
                priority: item.priority,
            });
        }

        let mut state = self.state.lock().await;
        let outcome = match state.position(&item.id) {
            Some(index) => {
                let existing = &mut state.items[index];
                existing.priority = item.priority;
                existing.dependencies = item.dependencies;
                existing.estimated_minutes = item.estimated_minutes;
                existing.merge_method = item.merge_method;
                existing.source_branch = item.source_branch;
                existing.target_branch = item.target_branch;
                // A failed attempt stays manual until an operator clears it
                if existing.failure_count == 0 {
                    existing.conflict_status = item.conflict_status;
                }
                debug!(change_request = %existing.id, priority = existing.priority, "Queue item updated");
                EnqueueOutcome::Updated
            }
            None => {
                debug!(change_request = %item.id, priority = item.priority, "Queue item added");
                state.items.push(item);
                EnqueueOutcome::Inserted
            }
        };
        state.sort();
        self.persist(&state).await?;
        Ok(outcome)
    }

    /// Up to `max_concurrent` eligible items in queue order, leased to the
    /// caller. Empty outside the merge window.
    pub async fn select_next_batch<Tz: TimeZone>(
        &self,
        max_concurrent: usize,
        now: &DateTime<Tz>,
    ) -> Vec<QueueItem> {
        if !self.window.is_open(now) {
            debug!("Merge window closed, nothing selected");
            return Vec::new();
        }

        let mut state = self.state.lock().await;
        let queued: HashSet<&ChangeRequestId> = state.items.iter().map(|item| &item.id).collect();

        let mut batch = Vec::new();
        for item in &state.items {
            if batch.len() >= max_concurrent {
                break;
            }
            if state.leased.contains(&item.id) || item.is_manual_required() {
                continue;
            }
            if let Some(blocker) = item
                .dependencies
                .iter()
                .find(|dep| *dep != &item.id && queued.contains(dep))
            {
                debug!(change_request = %item.id, blocked_by = %blocker, "Waiting on queued dependency");
                continue;
            }
            batch.push(item.clone());
        }
        drop(queued);

        for item in &batch {
            state.leased.insert(item.id.clone());
        }
        if !batch.is_empty() {
            info!(selected = batch.len(), queued = state.items.len(), "Batch selected");
        }
        batch
    }

    /// Record an attempt's outcome. Success removes the item; failure keeps it
    /// as manual_required with the error recorded. The lease is released
    /// either way.
    pub async fn dequeue(
        &self,
        id: &ChangeRequestId,
        outcome: MergeOutcome,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.leased.remove(id);
        let index = state
            .position(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        match outcome {
            MergeOutcome::Success => {
                state.items.remove(index);
                info!(change_request = %id, "Merged item removed from queue");
            }
            MergeOutcome::Failure { error } => {
                let item = &mut state.items[index];
                item.conflict_status = ConflictStatus::ManualRequired;
                item.failure_count += 1;
                warn!(
                    change_request = %id,
                    failures = item.failure_count,
                    error = %error,
                    "Merge failed, item marked manual_required"
                );
                item.last_error = Some(error);
            }
        }
        self.persist(&state).await
    }

    /// Return a manual_required item to normal scheduling
    pub async fn clear_manual(&self, id: &ChangeRequestId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let index = state
            .position(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        let item = &mut state.items[index];
        item.conflict_status = ConflictStatus::Unknown;
        item.last_error = None;
        info!(change_request = %id, "Manual flag cleared");
        self.persist(&state).await
    }

    /// Drop a lease without recording an outcome
    pub async fn release(&self, id: &ChangeRequestId) -> bool {
        self.state.lock().await.leased.remove(id)
    }

    /// Remove an item outright, e.g. when its change request was closed
    pub async fn remove(&self, id: &ChangeRequestId) -> Result<Option<QueueItem>, QueueError> {
        let mut state = self.state.lock().await;
        let removed = state.position(id).map(|index| state.items.remove(index));
        state.leased.remove(id);
        if removed.is_some() {
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &ChangeRequestId) -> Option<QueueItem> {
        let state = self.state.lock().await;
        state.position(id).map(|index| state.items[index].clone())
    }

    pub async fn items(&self) -> Vec<QueueItem> {
        self.state.lock().await.items.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    pub async fn status<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> QueueStatusReport {
        let state = self.state.lock().await;
        let mut by_conflict_status = BTreeMap::new();
        let mut by_priority = BTreeMap::new();
        let mut by_repository = BTreeMap::new();
        for item in &state.items {
            *by_conflict_status.entry(item.conflict_status).or_insert(0) += 1;
            *by_priority.entry(item.priority).or_insert(0) += 1;
            *by_repository.entry(item.id.repository.clone()).or_insert(0) += 1;
        }

        QueueStatusReport {
            total: state.items.len(),
            leased: state.leased.len(),
            by_conflict_status,
            by_priority,
            by_repository,
            window_open: self.window.is_open(now),
            next_window_opening: self
                .window
                .next_opening(now)
                .map(|opening| opening.with_timezone(&Utc)),
        }
    }

    pub async fn save(&self) -> Result<(), QueueError> {
        let state = self.state.lock().await;
        self.persist(&state).await
    }

    async fn persist(&self, state: &QueueState) -> Result<(), QueueError> {
        if let Some(store) = &self.store {
            store.save(&state.items).await?;
        }
        Ok(())
    }
}
