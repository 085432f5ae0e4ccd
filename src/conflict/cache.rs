use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::ConflictReport;
use crate::persistence::{JsonStore, PersistenceError};
use crate::provider::ChangeRequestId;

/// Conflict reports keyed by `repository#number`, considered fresh for a
/// fixed staleness window after `analyzed_at`
pub struct ReportCache {
    reports: Mutex<BTreeMap<String, ConflictReport>>,
    staleness: Duration,
    store: Option<JsonStore<BTreeMap<String, ConflictReport>>>,
}

impl ReportCache {
    pub fn new(staleness: Duration) -> Self {
        Self {
            reports: Mutex::new(BTreeMap::new()),
            staleness,
            store: None,
        }
    }

    /// Back the cache with `conflict_cache.json` at `path`
    pub fn with_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = Some(JsonStore::new(path));
        self
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// The cached report for `id` if it is younger than the staleness window
    pub async fn get_fresh(&self, id: &ChangeRequestId, now: DateTime<Utc>) -> Option<ConflictReport> {
        let reports = self.reports.lock().await;
        let report = reports.get(&id.key())?;
        if self.is_fresh(report, now) {
            Some(report.clone())
        } else {
            debug!(change_request = %id, "Cached conflict report is stale");
            None
        }
    }

    pub async fn insert(&self, report: ConflictReport) {
        self.reports
            .lock()
            .await
            .insert(report.change_request.key(), report);
    }

    pub async fn invalidate(&self, id: &ChangeRequestId) -> bool {
        self.reports.lock().await.remove(&id.key()).is_some()
    }

    pub async fn len(&self) -> usize {
        self.reports.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.reports.lock().await.is_empty()
    }

    /// Drop every stale entry, returning how many went
    pub async fn prune_stale(&self, now: DateTime<Utc>) -> usize {
        let mut reports = self.reports.lock().await;
        let before = reports.len();
        reports.retain(|_, report| self.is_fresh(report, now));
        before - reports.len()
    }

    pub async fn load(&self) -> Result<usize, PersistenceError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load().await?.unwrap_or_default();
        let count = loaded.len();
        *self.reports.lock().await = loaded;
        Ok(count)
    }

    pub async fn save(&self) -> Result<(), PersistenceError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let reports = self.reports.lock().await;
        store.save(&reports).await
    }

    fn is_fresh(&self, report: &ConflictReport, now: DateTime<Utc>) -> bool {
        match (now - report.analyzed_at).to_std() {
            Ok(age) => age < self.staleness,
            // Analyzed "in the future" (clock skew): treat as fresh
            Err(_) => true,
        }
    }
}
