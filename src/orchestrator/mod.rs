//! Orchestrator
//!
//! Wires the provider, analyzer, queue and coordinator together for one
//! run. Discovery fans out one producer task per repository and drains fan
//! out one task per merge operation; both rendezvous with the orchestrator on
//! a barrier before results are collected.

mod state;
pub mod types;

use chrono::{DateTime, TimeZone, Utc};
use fd_lock::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};

use crate::backup::{BackupManager, SnapshotManager};
use crate::config::MergeConductorConfig;
use crate::conflict::{ConflictAnalyzer, ConflictSource, Git2ConflictSource};
use crate::coordinator::{MergeCoordinator, MergeOperation};
use crate::external::{CommandExecutor, ProcessCommandExecutor};
use crate::gates::QualityGateRunner;
use crate::git::RemoteAccess;
use crate::priority::PriorityCalculator;
use crate::provider::{ChangeRequest, ChangeRequestId, ChangeRequestProvider, GitHubProvider, MergeMethod, ProviderError};
use crate::queue::{EnqueueOutcome, MergeOutcome, QueueError, QueueItem};
use crate::sync::BarrierSynchronizer;
use crate::telemetry::{create_run_span, generate_correlation_id};
use crate::workspace::{Git2Workspace, MergeWorkspace};

pub use state::{StateStore, CACHE_FILE, HISTORY_FILE, QUEUE_FILE};
pub use types::{
    AnalysisRun, AnalyzedChange, DiscoveredChange, DiscoveryResult, DrainOptions, DrainReport,
    EnqueueSummary, HistorySummary, OrchestratorError, RunStatus, StatusReport,
};

pub const DRAIN_LOCK_FILE: &str = "drain.lock";

/// Barrier participant name used by the orchestrator itself
const ORCHESTRATOR_PARTICIPANT: &str = "orchestrator";

/// External seams the orchestrator drives
pub struct Collaborators {
    pub provider: Arc<dyn ChangeRequestProvider>,
    pub conflict_source: Arc<dyn ConflictSource>,
    pub executor: Arc<dyn CommandExecutor>,
    pub snapshots: Arc<dyn SnapshotManager>,
    pub workspace: Arc<dyn MergeWorkspace>,
}

/// Result of `process`: analysis, enqueue and drain of one run
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub analysis: AnalysisRun,
    pub enqueued: EnqueueSummary,
    pub drain: DrainReport,
}

impl ProcessReport {
    pub fn status(&self) -> RunStatus {
        self.analysis.status().combine(self.drain.status())
    }
}

#[derive(Default)]
struct Listing {
    changes: Vec<DiscoveredChange>,
    skipped: Vec<ChangeRequestId>,
}

pub struct Orchestrator {
    provider: Arc<dyn ChangeRequestProvider>,
    analyzer: Arc<ConflictAnalyzer>,
    coordinator: Arc<MergeCoordinator>,
    snapshots: Arc<dyn SnapshotManager>,
    state: StateStore,
    sync: Arc<BarrierSynchronizer>,
    priority: PriorityCalculator,
    repositories: Vec<String>,
    default_merge_method: MergeMethod,
    max_concurrent: usize,
    sync_timeout: Duration,
    drain_timeout: Duration,
    keep_backups: usize,
}

impl Orchestrator {
    /// Production wiring: GitHub, git2 and real processes
    pub fn from_config(config: &MergeConductorConfig) -> Result<Self, OrchestratorError> {
        let token = config
            .github
            .token
            .clone()
            .ok_or(OrchestratorError::MissingToken)?;
        let provider = GitHubProvider::with_base_uri(
            token.clone(),
            config.github.requests_per_second,
            config.github.burst_capacity,
            config.github.api_url.as_deref(),
        )?;
        let snapshots = BackupManager::new(
            config.repository_path.clone(),
            config.backup_dir(),
            &config.backup.essential_patterns,
        )?;
        let remote = RemoteAccess::new(Some(token));
        let conflict_source =
            Git2ConflictSource::new(config.repository_path.clone()).with_remote(remote.clone());
        let workspace =
            Git2Workspace::new(config.repository_path.clone(), config.worktree_dir()).with_remote(remote);

        Self::new(
            config,
            Collaborators {
                provider: Arc::new(provider),
                conflict_source: Arc::new(conflict_source),
                executor: Arc::new(ProcessCommandExecutor),
                snapshots: Arc::new(snapshots),
                workspace: Arc::new(workspace),
            },
        )
    }

    pub fn new(
        config: &MergeConductorConfig,
        collaborators: Collaborators,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let analyzer = Arc::new(ConflictAnalyzer::new(
            collaborators.conflict_source,
            config.classifier()?,
            config.analyzer_settings()?,
        )?);
        let gates = QualityGateRunner::new(collaborators.executor)
            .with_overrides(&config.gates.commands)
            .map_err(crate::config::ConfigError::from)?
            .with_timeout(config.gate_timeout())
            .with_working_dir(config.repository_path.clone());
        let coordinator = Arc::new(MergeCoordinator::new(
            Arc::clone(&analyzer),
            Arc::new(gates),
            Arc::clone(&collaborators.snapshots),
            collaborators.workspace,
            Arc::clone(&collaborators.provider),
            config.coordinator_settings()?,
        ));

        Ok(Self {
            provider: collaborators.provider,
            analyzer,
            coordinator,
            snapshots: collaborators.snapshots,
            state: StateStore::open(config),
            sync: Arc::new(BarrierSynchronizer::new()),
            priority: config.priority_calculator(),
            repositories: config.repositories.clone(),
            default_merge_method: config.scheduling.default_merge_method,
            max_concurrent: config.scheduling.max_concurrent_merges,
            sync_timeout: config.sync_timeout(),
            drain_timeout: config.drain_timeout(),
            keep_backups: config.backup.keep_backups,
        })
    }

    pub async fn load_state(&self) -> Result<(), OrchestratorError> {
        self.state.load().await
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn synchronizer(&self) -> &BarrierSynchronizer {
        &self.sync
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Requested batch size, never above the configured concurrency limit
    pub fn batch_size(&self, options: DrainOptions) -> usize {
        options.max_concurrent.clamp(1, self.max_concurrent.max(1))
    }

    /// List open change requests and their touched resources, one producer
    /// task per repository. `repository` narrows the run to one repository.
    pub async fn discover(
        &self,
        run_id: &str,
        repository: Option<&str>,
    ) -> Result<DiscoveryResult, OrchestratorError> {
        let repositories: Vec<String> = match repository {
            Some(repository) => vec![repository.to_string()],
            None => self.repositories.clone(),
        };
        let mut result = DiscoveryResult::default();
        if repositories.is_empty() {
            warn!("No repositories configured, nothing to discover");
            return Ok(result);
        }

        let point = format!("discovery-{run_id}");
        let participants = repositories
            .iter()
            .cloned()
            .chain([ORCHESTRATOR_PARTICIPANT.to_string()]);
        self.sync
            .create_sync_point(&point, participants, self.sync_timeout)
            .await?;

        let mut producers = JoinSet::new();
        for repository in repositories.iter().cloned() {
            let provider = Arc::clone(&self.provider);
            let sync = Arc::clone(&self.sync);
            let point = point.clone();
            producers.spawn(
                async move {
                    let listing = produce(provider.as_ref(), &repository).await;
                    if let Err(e) = sync.join(&point, &repository).await {
                        warn!(repository = %repository, error = %e, "Producer could not join discovery");
                    }
                    (repository, listing)
                }
                .in_current_span(),
            );
        }

        let rendezvous = self.sync.join(&point, ORCHESTRATOR_PARTICIPANT).await?;
        if !rendezvous.success {
            warn!(
                diagnostic = ?rendezvous.diagnostic,
                "Discovery rendezvous timed out, abandoning late producers"
            );
            producers.abort_all();
        }

        while let Some(joined) = producers.join_next().await {
            match joined {
                Ok((repository, Ok(listing))) => {
                    info!(
                        repository = %repository,
                        change_requests = listing.changes.len(),
                        skipped = listing.skipped.len(),
                        "Repository discovered"
                    );
                    result.listed_repositories.push(repository);
                    result.changes.extend(listing.changes);
                    result.skipped.extend(listing.skipped);
                }
                Ok((repository, Err(e))) => {
                    warn!(repository = %repository, error = %e, "Repository listing failed");
                    result.failed_repositories.push((repository, e.to_string()));
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "Discovery producer panicked"),
            }
        }

        for repository in repositories {
            let reported = result.listed_repositories.contains(&repository)
                || result.failed_repositories.iter().any(|(r, _)| r == &repository);
            if !reported {
                result
                    .failed_repositories
                    .push((repository, "did not report before the discovery timeout".to_string()));
            }
        }
        self.sync.cleanup(&point).await?;

        result.listed_repositories.sort();
        result.failed_repositories.sort();
        result
            .changes
            .sort_by(|a, b| a.change_request.id.cmp(&b.change_request.id));
        Ok(result)
    }

    /// Discover and analyze without touching the queue
    pub async fn analyze(&self, repository: Option<&str>) -> Result<AnalysisRun, OrchestratorError> {
        let run_id = generate_correlation_id();
        let span = create_run_span("analyze", &run_id);
        self.analyze_run(&run_id, repository).instrument(span).await
    }

    async fn analyze_run(
        &self,
        run_id: &str,
        repository: Option<&str>,
    ) -> Result<AnalysisRun, OrchestratorError> {
        let discovery = self.discover(run_id, repository).await?;
        let now = Utc::now();

        let mut analyzed = Vec::with_capacity(discovery.changes.len());
        for change in &discovery.changes {
            let report = self
                .analyzer
                .analyze_cached(self.state.cache(), &change.change_request, &change.touched)
                .await;
            let priority = self.priority.priority(&change.change_request, now);
            analyzed.push(AnalyzedChange {
                change_request: change.change_request.clone(),
                report,
                priority,
            });
        }

        let pruned = self.state.cache().prune_stale(now).await;
        self.state.cache().save().await?;
        info!(
            analyzed = analyzed.len(),
            pruned_cache_entries = pruned,
            "Analysis complete"
        );

        Ok(AnalysisRun {
            run_id: run_id.to_string(),
            discovery,
            analyzed,
        })
    }

    /// Enqueue every analyzed change request and drop queued items whose
    /// change request is no longer open in a repository that was listed
    pub async fn enqueue_discovered(
        &self,
        run: &AnalysisRun,
    ) -> Result<EnqueueSummary, OrchestratorError> {
        let mut summary = EnqueueSummary::default();
        for change in &run.analyzed {
            let item = QueueItem::from_analysis(
                &change.change_request,
                &change.report,
                change.priority,
                self.default_merge_method,
            );
            match self.state.queue().enqueue(item).await? {
                EnqueueOutcome::Inserted => summary.inserted += 1,
                EnqueueOutcome::Updated => summary.updated += 1,
            }
        }

        let open: HashSet<&ChangeRequestId> = run
            .analyzed
            .iter()
            .map(|change| &change.change_request.id)
            .chain(run.discovery.skipped.iter())
            .collect();
        for item in self.state.queue().items().await {
            let listed = run
                .discovery
                .listed_repositories
                .contains(&item.id.repository);
            if listed && !open.contains(&item.id) {
                self.state.queue().remove(&item.id).await?;
                self.state.cache().invalidate(&item.id).await;
                info!(change_request = %item.id, "Closed change request removed from queue");
                summary.removed.push(item.id);
            }
        }

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            removed = summary.removed.len(),
            "Queue updated"
        );
        Ok(summary)
    }

    /// Select a batch and merge it. Only one drain may run per state
    /// directory; `known` supplies the change requests discovered this run.
    pub async fn drain<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
        known: &[ChangeRequest],
        options: DrainOptions,
    ) -> Result<DrainReport, OrchestratorError> {
        let run_id = generate_correlation_id();
        let span = create_run_span("drain", &run_id);
        self.drain_run(&run_id, now, known, options)
            .instrument(span)
            .await
    }

    async fn drain_run<Tz: TimeZone>(
        &self,
        run_id: &str,
        now: &DateTime<Tz>,
        known: &[ChangeRequest],
        options: DrainOptions,
    ) -> Result<DrainReport, OrchestratorError> {
        tokio::fs::create_dir_all(self.state.dir())
            .await
            .map_err(|source| OrchestratorError::Io {
                path: self.state.dir().to_path_buf(),
                source,
            })?;
        let lock_path = self.state.dir().join(DRAIN_LOCK_FILE);
        let lock_file = std::fs::File::create(&lock_path).map_err(|source| OrchestratorError::Io {
            path: lock_path.clone(),
            source,
        })?;
        let mut lock = RwLock::new(lock_file);
        let _guard = lock
            .try_write()
            .map_err(|_| OrchestratorError::DrainLocked {
                path: lock_path.clone(),
            })?;

        let batch = self
            .state
            .queue()
            .select_next_batch(self.batch_size(options), now)
            .await;
        let mut report = DrainReport {
            run_id: run_id.to_string(),
            dry_run: options.dry_run,
            selected: batch.iter().map(|item| item.id.clone()).collect(),
            ..Default::default()
        };
        if batch.is_empty() {
            info!("Nothing eligible to merge");
            return Ok(report);
        }

        if options.dry_run {
            for item in &batch {
                info!(change_request = %item.id, priority = item.priority, "Would merge");
                self.state.queue().release(&item.id).await;
            }
            return Ok(report);
        }

        let known: HashMap<&ChangeRequestId, &ChangeRequest> =
            known.iter().map(|cr| (&cr.id, cr)).collect();
        let mut runnable = Vec::with_capacity(batch.len());
        for item in batch {
            match known.get(&item.id) {
                Some(change_request) => runnable.push((item, (*change_request).clone())),
                None => {
                    warn!(change_request = %item.id, "Not discovered in this run, skipping");
                    self.state.queue().release(&item.id).await;
                    report.skipped.push(item.id);
                }
            }
        }
        if runnable.is_empty() {
            return Ok(report);
        }

        let operations = self.execute_batch(run_id, runnable, &mut report).await?;
        self.record(&operations).await?;
        report.operations = operations;

        self.state.save().await?;
        match self.snapshots.prune(self.keep_backups).await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "Old backups pruned"),
            Err(e) => warn!(error = %e, "Backup pruning failed"),
        }

        info!(
            merged = report.merged().count(),
            failed = report.failed().count(),
            skipped = report.skipped.len(),
            "Drain finished"
        );
        Ok(report)
    }

    /// Run every operation as its own task and wait for all of them. The
    /// rendezvous bounds how long the orchestrator waits before logging, but
    /// in-flight merges are never cancelled.
    async fn execute_batch(
        &self,
        run_id: &str,
        runnable: Vec<(QueueItem, ChangeRequest)>,
        report: &mut DrainReport,
    ) -> Result<Vec<MergeOperation>, OrchestratorError> {
        let point = format!("drain-{run_id}");
        let participants = runnable
            .iter()
            .map(|(item, _)| item.id.key())
            .chain([ORCHESTRATOR_PARTICIPANT.to_string()]);
        self.sync
            .create_sync_point(&point, participants, self.drain_timeout)
            .await?;

        let attempted: Vec<ChangeRequestId> =
            runnable.iter().map(|(item, _)| item.id.clone()).collect();
        let mut tasks = JoinSet::new();
        for (item, change_request) in runnable {
            let coordinator = Arc::clone(&self.coordinator);
            let sync = Arc::clone(&self.sync);
            let point = point.clone();
            tasks.spawn(
                async move {
                    let op = coordinator.execute(&item, &change_request).await;
                    if let Err(e) = sync.join(&point, &item.id.key()).await {
                        warn!(change_request = %item.id, error = %e, "Operation could not join drain");
                    }
                    op
                }
                .in_current_span(),
            );
        }

        let rendezvous = self.sync.join(&point, ORCHESTRATOR_PARTICIPANT).await?;
        if !rendezvous.success {
            warn!(
                diagnostic = ?rendezvous.diagnostic,
                "Drain rendezvous timed out, waiting for in-flight merges"
            );
        }

        let mut operations = Vec::with_capacity(attempted.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(op) => operations.push(op),
                Err(e) => error!(error = %e, "Merge task panicked"),
            }
        }
        self.sync.cleanup(&point).await?;

        for id in &attempted {
            if !operations.iter().any(|op| &op.change_request == id) {
                self.state.queue().release(id).await;
                report.skipped.push(id.clone());
            }
        }
        operations.sort_by_key(|op| {
            attempted
                .iter()
                .position(|id| id == &op.change_request)
                .unwrap_or(usize::MAX)
        });
        Ok(operations)
    }

    /// Append to history, settle queue items and tell authors about failures
    async fn record(&self, operations: &[MergeOperation]) -> Result<(), OrchestratorError> {
        self.state.history().append(operations.to_vec()).await?;

        for op in operations {
            let outcome = if op.succeeded() {
                self.state.cache().invalidate(&op.change_request).await;
                MergeOutcome::Success
            } else {
                MergeOutcome::Failure {
                    error: op.failure_summary(),
                }
            };
            match self.state.queue().dequeue(&op.change_request, outcome).await {
                Ok(()) => {}
                Err(QueueError::NotFound(id)) => {
                    warn!(change_request = %id, "Item left the queue during the merge")
                }
                Err(e) => return Err(e.into()),
            }

            if !op.succeeded() {
                if let Err(e) = self.provider.comment(&op.change_request, &failure_comment(op)).await {
                    warn!(change_request = %op.change_request, error = %e, "Could not comment on failure");
                }
            }
        }
        Ok(())
    }

    /// Analyze, enqueue and drain in one run
    pub async fn process<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
        options: DrainOptions,
    ) -> Result<ProcessReport, OrchestratorError> {
        let run_id = generate_correlation_id();
        let span = create_run_span("process", &run_id);
        async {
            let analysis = self.analyze_run(&run_id, None).await?;
            let enqueued = self.enqueue_discovered(&analysis).await?;
            let drain = self
                .drain_run(&run_id, now, &analysis.change_requests(), options)
                .await?;
            Ok(ProcessReport {
                analysis,
                enqueued,
                drain,
            })
        }
        .instrument(span)
        .await
    }

    /// Queue status plus a history summary
    pub async fn status<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<StatusReport, OrchestratorError> {
        self.state.status(now).await
    }

    pub async fn clear(&self, id: &ChangeRequestId) -> Result<(), OrchestratorError> {
        self.state.clear(id).await
    }

    pub fn state_dir(&self) -> &Path {
        self.state.dir()
    }
}

async fn produce(
    provider: &dyn ChangeRequestProvider,
    repository: &str,
) -> Result<Listing, ProviderError> {
    let open = provider.list_open(repository).await?;
    let mut listing = Listing::default();
    for change_request in open {
        match provider.touched_resources(&change_request.id).await {
            Ok(touched) => listing.changes.push(DiscoveredChange {
                change_request,
                touched,
            }),
            Err(e) => {
                warn!(change_request = %change_request.id, error = %e, "Could not list touched resources");
                listing.skipped.push(change_request.id);
            }
        }
    }
    Ok(listing)
}

fn failure_comment(op: &MergeOperation) -> String {
    let mut body = String::new();
    body.push_str("❌ **Automated merge failed**\n\n");
    body.push_str(&format!("{}\n", op.failure_summary()));
    for error in op.errors.iter().skip(1) {
        body.push_str(&format!("- {error}\n"));
    }
    if op.manual_recovery_required {
        body.push_str("\n⚠️ Rollback failed. The target branch needs manual recovery");
        if let Some(backup) = &op.backup {
            body.push_str(&format!(" from backup `{}` ({})", backup.id, backup.location));
        }
        body.push_str(".\n");
    } else if op.rollback_performed {
        body.push_str("\n↩️ The merge was rolled back.\n");
    }
    body.push_str(&format!(
        "\nThis request is held until an operator runs `merge-conductor clear {}`.\n",
        op.change_request
    ));
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MergePhase;

    fn failed_op(phase: MergePhase) -> MergeOperation {
        let mut op = MergeOperation::new(ChangeRequestId::new("acme/widgets", 7), "feature", "main");
        op.enter(phase);
        op.fail("boom");
        op
    }

    #[test]
    fn test_drain_status_is_failure_when_every_backup_failed() {
        let report = DrainReport {
            operations: vec![failed_op(MergePhase::BackupCreation)],
            ..Default::default()
        };
        assert_eq!(report.status(), RunStatus::Failure);
        assert_eq!(report.status().exit_code(), 1);
    }

    #[test]
    fn test_drain_status_is_partial_with_mixed_results() {
        let mut merged = MergeOperation::new(ChangeRequestId::new("acme/widgets", 8), "f", "main");
        merged.complete();
        let report = DrainReport {
            operations: vec![merged, failed_op(MergePhase::PreMergeGates)],
            ..Default::default()
        };
        assert_eq!(report.status(), RunStatus::Partial);

        let empty = DrainReport::default();
        assert_eq!(empty.status(), RunStatus::Success);
    }

    #[test]
    fn test_run_status_combines_to_the_worse() {
        assert_eq!(RunStatus::Success.combine(RunStatus::Partial), RunStatus::Partial);
        assert_eq!(RunStatus::Partial.combine(RunStatus::Failure), RunStatus::Failure);
        assert_eq!(RunStatus::Success.combine(RunStatus::Success), RunStatus::Success);
    }

    #[test]
    fn test_failure_comment_mentions_manual_recovery() {
        let mut op = failed_op(MergePhase::PostMergeGates);
        op.rollback_performed = true;
        op.rollback_failed = true;
        op.manual_recovery_required = true;
        let body = failure_comment(&op);
        assert!(body.contains("post_merge_gates: boom"));
        assert!(body.contains("manual recovery"));
        assert!(body.contains("merge-conductor clear acme/widgets#7"));
    }

    #[test]
    fn test_history_summary_counts() {
        let mut merged = MergeOperation::new(ChangeRequestId::new("acme/widgets", 1), "f", "main");
        merged.complete();
        let mut rolled_back = failed_op(MergePhase::PostMergeGates);
        rolled_back.rollback_performed = true;

        let summary = HistorySummary::from_operations(&[merged, rolled_back]);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rolled_back, 1);
        assert_eq!(summary.manual_recovery_required, 0);
        assert!(summary.last_finished_at.is_some());
    }
}
