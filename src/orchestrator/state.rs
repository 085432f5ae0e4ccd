use chrono::{DateTime, TimeZone};
use std::path::{Path, PathBuf};
use tracing::info;

use super::types::{HistorySummary, OrchestratorError, StatusReport};
use crate::config::MergeConductorConfig;
use crate::conflict::ReportCache;
use crate::coordinator::MergeOperation;
use crate::persistence::HistoryLog;
use crate::provider::ChangeRequestId;
use crate::queue::MergeQueue;

pub const QUEUE_FILE: &str = "queue.json";
pub const CACHE_FILE: &str = "conflict_cache.json";
pub const HISTORY_FILE: &str = "history.json";

/// Everything persisted under the state directory. Usable without a
/// provider, so `status` and `clear` work offline.
pub struct StateStore {
    dir: PathBuf,
    queue: MergeQueue,
    cache: ReportCache,
    history: HistoryLog<MergeOperation>,
}

impl StateStore {
    pub fn open(config: &MergeConductorConfig) -> Self {
        let dir = config.state_dir.clone();
        Self {
            queue: MergeQueue::new(config.scheduling.merge_window.clone())
                .with_store(dir.join(QUEUE_FILE)),
            cache: ReportCache::new(config.cache_staleness()).with_store(dir.join(CACHE_FILE)),
            history: HistoryLog::new(dir.join(HISTORY_FILE)),
            dir,
        }
    }

    /// Read the persisted queue and conflict cache
    pub async fn load(&self) -> Result<(), OrchestratorError> {
        let queued = self.queue.load().await?;
        let cached = self.cache.load().await?;
        info!(queued, cached, state_dir = ?self.dir, "State loaded");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn queue(&self) -> &MergeQueue {
        &self.queue
    }

    pub fn cache(&self) -> &ReportCache {
        &self.cache
    }

    pub fn history(&self) -> &HistoryLog<MergeOperation> {
        &self.history
    }

    pub async fn status<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
    ) -> Result<StatusReport, OrchestratorError> {
        let history = self.history.entries().await?;
        Ok(StatusReport {
            queue: self.queue.status(now).await,
            history: HistorySummary::from_operations(&history),
        })
    }

    /// Return a manual_required item to scheduling and drop its cached report
    pub async fn clear(&self, id: &ChangeRequestId) -> Result<(), OrchestratorError> {
        self.queue.clear_manual(id).await?;
        self.cache.invalidate(id).await;
        self.cache.save().await?;
        Ok(())
    }

    /// Flush queue and cache
    pub async fn save(&self) -> Result<(), OrchestratorError> {
        self.queue.save().await?;
        self.cache.save().await?;
        Ok(())
    }
}
