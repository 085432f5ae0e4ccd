//! Shared fakes for integration tests. Each implements one of the crate's
//! public seams in memory so the orchestrator and coordinator can be driven
//! end to end without GitHub, git or real processes.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use merge_conductor::backup::{BackupError, BackupHandle, BackupMethod, RepositoryStatus, RestoreOutcome, SnapshotManager};
use merge_conductor::conflict::{ConflictError, ConflictSource, ConflictedResource, ResolvedResource};
use merge_conductor::workspace::{LocalMerge, MergeWorkspace, PreparedMerge, WorkspaceError};
use merge_conductor::external::{CommandError, CommandExecutor, CommandOutput};
use merge_conductor::merge_window::MergeWindow;
use merge_conductor::orchestrator::{Collaborators, Orchestrator};
use merge_conductor::provider::{
    ChangeRequest, ChangeRequestId, ChangeRequestProvider, MergeMethod, MergeReceipt, ProviderError, ReviewState,
};
use merge_conductor::MergeConductorConfig;
use uuid::Uuid;

pub const REPO: &str = "acme/widgets";

/// Change request opened `age_days` ago with the given labels
pub fn change_request(number: u64, labels: &[&str], age_days: i64) -> ChangeRequest {
    ChangeRequest {
        id: ChangeRequestId::new(REPO, number),
        title: format!("Change {number}"),
        description: String::new(),
        source_branch: format!("feature-{number}"),
        target_branch: "main".to_string(),
        author: "contributor".to_string(),
        created_at: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap() - ChronoDuration::days(age_days),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        mergeable: Some(true),
    }
}

/// Defaults with gates mapped to the scripted `gate <name>` program, an
/// always-open window and state under `dir`
pub fn test_config(dir: &TempDir) -> MergeConductorConfig {
    let mut config = MergeConductorConfig::default();
    config.repositories = vec![REPO.to_string()];
    config.repository_path = dir.path().join("repo");
    config.state_dir = dir.path().join("state");
    config.scheduling.merge_window = MergeWindow::always_open();
    config.sync.timeout_seconds = 5;
    config.sync.drain_timeout_seconds = 5;
    for gate in ["lint", "test-suite", "smoke-test", "rollback-validation"] {
        config
            .gates
            .commands
            .insert(gate.to_string(), vec!["gate".to_string(), gate.to_string()]);
    }
    config
}

pub struct Harness {
    pub provider: Arc<FakeProvider>,
    pub source: Arc<FakeConflictSource>,
    pub executor: Arc<ScriptedExecutor>,
    pub snapshots: Arc<FakeSnapshots>,
    pub workspace: Arc<FakeWorkspace>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            provider: Arc::new(FakeProvider::default()),
            source: Arc::new(FakeConflictSource::default()),
            executor: Arc::new(ScriptedExecutor::default()),
            snapshots: Arc::new(FakeSnapshots::default()),
            workspace: Arc::new(FakeWorkspace::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provider: self.provider.clone(),
            conflict_source: self.source.clone(),
            executor: self.executor.clone(),
            snapshots: self.snapshots.clone(),
            workspace: self.workspace.clone(),
        }
    }

    pub fn orchestrator(&self, config: &MergeConductorConfig) -> Orchestrator {
        Orchestrator::new(config, self.collaborators()).unwrap()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct FakeProvider {
    open: Mutex<HashMap<String, Vec<ChangeRequest>>>,
    touched: Mutex<HashMap<ChangeRequestId, Vec<String>>>,
    failing_repositories: Mutex<HashSet<String>>,
    failing_merges: Mutex<HashSet<ChangeRequestId>>,
    reviews: Mutex<HashMap<ChangeRequestId, ReviewState>>,
    pub merged: Mutex<Vec<(ChangeRequestId, MergeMethod)>>,
    pub comments: Mutex<Vec<(ChangeRequestId, String)>>,
}

impl FakeProvider {
    pub fn add(&self, change_request: ChangeRequest, touched: &[&str]) {
        self.touched.lock().unwrap().insert(
            change_request.id.clone(),
            touched.iter().map(|t| t.to_string()).collect(),
        );
        self.open
            .lock()
            .unwrap()
            .entry(change_request.id.repository.clone())
            .or_default()
            .push(change_request);
    }

    /// Simulate the change request being merged or closed elsewhere
    pub fn close(&self, id: &ChangeRequestId) {
        if let Some(list) = self.open.lock().unwrap().get_mut(&id.repository) {
            list.retain(|cr| &cr.id != id);
        }
    }

    pub fn fail_repository(&self, repository: &str) {
        self.failing_repositories
            .lock()
            .unwrap()
            .insert(repository.to_string());
    }

    pub fn fail_merge(&self, id: &ChangeRequestId) {
        self.failing_merges.lock().unwrap().insert(id.clone());
    }

    pub fn set_review(&self, id: &ChangeRequestId, review: ReviewState) {
        self.reviews.lock().unwrap().insert(id.clone(), review);
    }

    pub fn merged_ids(&self) -> Vec<ChangeRequestId> {
        self.merged.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn comments_for(&self, id: &ChangeRequestId) -> Vec<String> {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| target == id)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl ChangeRequestProvider for FakeProvider {
    async fn list_open(&self, repository: &str) -> Result<Vec<ChangeRequest>, ProviderError> {
        if self.failing_repositories.lock().unwrap().contains(repository) {
            return Err(ProviderError::Unavailable(format!("{repository} is down")));
        }
        Ok(self
            .open
            .lock()
            .unwrap()
            .get(repository)
            .cloned()
            .unwrap_or_default())
    }

    async fn touched_resources(&self, id: &ChangeRequestId) -> Result<Vec<String>, ProviderError> {
        self.touched
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::Unavailable(format!("no files for {id}")))
    }

    async fn review_state(&self, id: &ChangeRequestId) -> Result<ReviewState, ProviderError> {
        Ok(self
            .reviews
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or_default())
    }

    async fn merge(&self, id: &ChangeRequestId, method: MergeMethod) -> Result<MergeReceipt, ProviderError> {
        if self.failing_merges.lock().unwrap().contains(id) {
            return Err(ProviderError::NotMerged {
                id: id.clone(),
                reason: "branch protection".to_string(),
            });
        }
        self.merged.lock().unwrap().push((id.clone(), method));
        self.close(id);
        Ok(MergeReceipt {
            merged: true,
            sha: Some(format!("sha-{}", id.number)),
        })
    }

    async fn comment(&self, id: &ChangeRequestId, body: &str) -> Result<(), ProviderError> {
        self.comments
            .lock()
            .unwrap()
            .push((id.clone(), body.to_string()));
        Ok(())
    }
}

/// Paths the target branch changed since the merge base
#[derive(Default)]
pub struct FakeConflictSource {
    modified: Mutex<Vec<String>>,
    unavailable: Mutex<bool>,
}

impl FakeConflictSource {
    pub fn modify(&self, path: &str) {
        self.modified.lock().unwrap().push(path.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }
}

#[async_trait]
impl ConflictSource for FakeConflictSource {
    async fn modified_on_target(&self, _change_request: &ChangeRequest) -> Result<Vec<String>, ConflictError> {
        if *self.unavailable.lock().unwrap() {
            return Err(ConflictError::SourceUnavailable("clone missing".to_string()));
        }
        Ok(self.modified.lock().unwrap().clone())
    }
}

/// In-memory worktrees. Each operation gets `/work/<number>-<op>`; conflicts
/// scripted with `conflict` show up in every local merge.
#[derive(Default)]
pub struct FakeWorkspace {
    conflicts: Mutex<Vec<ConflictedResource>>,
    open_fails: Mutex<bool>,
    revert_fails: Mutex<bool>,
    pub opened: Mutex<Vec<PreparedMerge>>,
    pub written: Mutex<Vec<ResolvedResource>>,
    pub published: Mutex<Vec<Vec<String>>>,
    pub checkouts: Mutex<Vec<Option<String>>>,
    pub reverted: Mutex<Vec<String>>,
    pub discarded: AtomicUsize,
}

impl FakeWorkspace {
    pub fn conflict(&self, path: &str, content: &str) {
        self.conflicts.lock().unwrap().push(ConflictedResource {
            path: path.to_string(),
            content: content.to_string(),
        });
    }

    pub fn set_open_fails(&self, fails: bool) {
        *self.open_fails.lock().unwrap() = fails;
    }

    pub fn set_revert_fails(&self, fails: bool) {
        *self.revert_fails.lock().unwrap() = fails;
    }

    pub fn discard_count(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    pub fn dir_for(&self, number: u64) -> Option<PathBuf> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.change_request.number == number)
            .map(|p| p.dir.clone())
    }
}

#[async_trait]
impl MergeWorkspace for FakeWorkspace {
    async fn open(&self, operation: Uuid, change_request: &ChangeRequest) -> Result<PreparedMerge, WorkspaceError> {
        if *self.open_fails.lock().unwrap() {
            return Err(WorkspaceError::Unavailable {
                path: PathBuf::from("/work"),
                reason: "not a repository".to_string(),
            });
        }
        let short: String = operation.simple().to_string().chars().take(8).collect();
        let prepared = PreparedMerge {
            operation,
            change_request: change_request.id.clone(),
            dir: PathBuf::from(format!("/work/{}-{short}", change_request.id.number)),
            worktree: format!("mc-{short}"),
            branch: format!("merge-conductor/{short}"),
            source_branch: change_request.source_branch.clone(),
            target_branch: change_request.target_branch.clone(),
            source_sha: format!("source-{}", change_request.id.number),
        };
        self.opened.lock().unwrap().push(prepared.clone());
        Ok(prepared)
    }

    async fn merge(&self, _prepared: &PreparedMerge) -> Result<LocalMerge, WorkspaceError> {
        Ok(LocalMerge {
            conflicted: self.conflicts.lock().unwrap().iter().map(|c| c.path.clone()).collect(),
            up_to_date: false,
        })
    }

    async fn read_conflicted(
        &self,
        _prepared: &PreparedMerge,
        paths: &[String],
    ) -> Result<Vec<ConflictedResource>, WorkspaceError> {
        let conflicts = self.conflicts.lock().unwrap();
        Ok(paths
            .iter()
            .map(|path| ConflictedResource {
                path: path.clone(),
                content: conflicts
                    .iter()
                    .find(|c| &c.path == path)
                    .map(|c| c.content.clone())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn write_resolved(&self, _prepared: &PreparedMerge, resolved: &[ResolvedResource]) -> Result<(), WorkspaceError> {
        self.written.lock().unwrap().extend(resolved.iter().cloned());
        Ok(())
    }

    async fn publish_resolution(&self, prepared: &PreparedMerge, resolved_paths: &[String]) -> Result<String, WorkspaceError> {
        self.published.lock().unwrap().push(resolved_paths.to_vec());
        Ok(format!("resolution-{}", prepared.change_request.number))
    }

    async fn checkout_merged(&self, _prepared: &PreparedMerge, merge_sha: Option<&str>) -> Result<String, WorkspaceError> {
        self.checkouts.lock().unwrap().push(merge_sha.map(str::to_string));
        Ok(merge_sha.unwrap_or("head").to_string())
    }

    async fn revert_merge(&self, prepared: &PreparedMerge, merge_sha: &str) -> Result<String, WorkspaceError> {
        if *self.revert_fails.lock().unwrap() {
            return Err(WorkspaceError::RevertConflict {
                sha: merge_sha.to_string(),
                branch: prepared.target_branch.clone(),
            });
        }
        self.reverted.lock().unwrap().push(merge_sha.to_string());
        Ok(format!("revert-{}", prepared.change_request.number))
    }

    async fn discard(&self, _prepared: &PreparedMerge) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runs `gate <name>` by looking up the scripted result for `<name>`.
/// Unscripted gates pass.
#[derive(Default)]
pub struct ScriptedExecutor {
    outcomes: Mutex<HashMap<String, Result<CommandOutput, CommandError>>>,
    dir_failures: Mutex<Vec<(String, String, String)>>,
    delay: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<String>>,
    pub dirs: Mutex<Vec<(String, Option<PathBuf>)>>,
}

impl ScriptedExecutor {
    pub fn fail(&self, gate: &str, stderr: &str) {
        self.outcomes.lock().unwrap().insert(
            gate.to_string(),
            Ok(CommandOutput {
                status_code: 1,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }),
        );
    }

    /// Fail `gate` only when it runs in a directory containing `fragment`
    pub fn fail_in(&self, gate: &str, fragment: &str, stderr: &str) {
        self.dir_failures
            .lock()
            .unwrap()
            .push((gate.to_string(), fragment.to_string(), stderr.to_string()));
    }

    pub fn dirs_for(&self, gate: &str) -> Vec<Option<PathBuf>> {
        self.dirs
            .lock()
            .unwrap()
            .iter()
            .filter(|(g, _)| g == gate)
            .map(|(_, dir)| dir.clone())
            .collect()
    }

    pub fn pass(&self, gate: &str) {
        self.outcomes.lock().unwrap().remove(gate);
    }

    /// Every gate takes this long
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls_for(&self, gate: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == gate).count()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _program: &str,
        args: &[String],
        working_dir: Option<&Path>,
        _timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let gate = args.first().cloned().unwrap_or_default();
        self.calls.lock().unwrap().push(gate.clone());
        self.dirs
            .lock()
            .unwrap()
            .push((gate.clone(), working_dir.map(Path::to_path_buf)));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let dir = working_dir.map(|d| d.display().to_string()).unwrap_or_default();
        let dir_failure = self
            .dir_failures
            .lock()
            .unwrap()
            .iter()
            .find(|(g, fragment, _)| *g == gate && dir.contains(fragment.as_str()))
            .map(|(_, _, stderr)| stderr.clone());
        if let Some(stderr) = dir_failure {
            return Ok(CommandOutput {
                status_code: 1,
                stdout: String::new(),
                stderr,
            });
        }
        let scripted = self.outcomes.lock().unwrap().get(&gate).cloned();
        scripted.unwrap_or_else(|| {
            Ok(CommandOutput {
                status_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        })
    }
}

/// Counts snapshots and restores; outcomes are switchable
#[derive(Default)]
pub struct FakeSnapshots {
    pub snapshots: AtomicUsize,
    pub restores: AtomicUsize,
    snapshot_unavailable: Mutex<bool>,
    restore_fails: Mutex<bool>,
}

impl FakeSnapshots {
    pub fn set_snapshot_unavailable(&self, unavailable: bool) {
        *self.snapshot_unavailable.lock().unwrap() = unavailable;
    }

    pub fn set_restore_fails(&self, fails: bool) {
        *self.restore_fails.lock().unwrap() = fails;
    }

    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotManager for FakeSnapshots {
    async fn snapshot(&self, workdir: &Path) -> Result<BackupHandle, BackupError> {
        if *self.snapshot_unavailable.lock().unwrap() {
            return Err(BackupError::BackupUnavailable("disk full".to_string()));
        }
        let n = self.snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(BackupHandle {
            id: format!("backup-{n}"),
            timestamp: Utc::now(),
            location: format!("refs/heads/backup/backup-{n}"),
            method: BackupMethod::FullHistory,
            status: RepositoryStatus {
                head: Some("abc123".to_string()),
                branch: Some("main".to_string()),
                dirty_paths: vec![],
            },
            host: "test-host".to_string(),
            repository: workdir.to_path_buf(),
            restore_method: None,
        })
    }

    async fn restore(&self, _handle: &BackupHandle) -> RestoreOutcome {
        self.restores.fetch_add(1, Ordering::SeqCst);
        if *self.restore_fails.lock().unwrap() {
            RestoreOutcome {
                success: false,
                method: None,
                errors: vec![
                    "full_history: reset failed".to_string(),
                    "file_copy: no copy".to_string(),
                ],
            }
        } else {
            RestoreOutcome {
                success: true,
                method: Some(BackupMethod::FullHistory),
                errors: vec![],
            }
        }
    }

    async fn prune(&self, _keep: usize) -> Result<usize, BackupError> {
        Ok(0)
    }
}
