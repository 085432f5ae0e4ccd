//! Per-operation merge workspaces
//!
//! Every merge operation gets its own git worktree on a private branch, so
//! concurrent operations never share a checkout. The worktree starts at the
//! source tip for the pre-merge gates, then merges the source into the
//! target locally so conflicts surface as markers on disk. Resolved merges
//! are published to the source branch before the provider merges; a merge
//! that fails its post-merge gates is reverted on the target branch.

pub mod types;

use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Index, Oid, Repository, ResetType, Signature, WorktreeAddOptions,
    WorktreePruneOptions,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conflict::{ConflictedResource, ResolvedResource};
use crate::git::{branch_tip, RemoteAccess};
use crate::provider::ChangeRequest;

pub use types::{LocalMerge, PreparedMerge, WorkspaceError};

const WORKTREE_PREFIX: &str = "mc-";
const BRANCH_PREFIX: &str = "merge-conductor/";
const COMMITTER_NAME: &str = "merge-conductor";
const COMMITTER_EMAIL: &str = "merge-conductor@localhost";

/// Local git work for one merge operation
#[async_trait]
pub trait MergeWorkspace: Send + Sync {
    /// Create the operation's worktree, checked out at the source tip
    async fn open(
        &self,
        operation: Uuid,
        change_request: &ChangeRequest,
    ) -> Result<PreparedMerge, WorkspaceError>;

    /// Merge the source into the target inside the worktree. Conflicts are
    /// left on disk with markers; the target side is "current".
    async fn merge(&self, prepared: &PreparedMerge) -> Result<LocalMerge, WorkspaceError>;

    async fn read_conflicted(
        &self,
        prepared: &PreparedMerge,
        paths: &[String],
    ) -> Result<Vec<ConflictedResource>, WorkspaceError>;

    async fn write_resolved(
        &self,
        prepared: &PreparedMerge,
        resolved: &[ResolvedResource],
    ) -> Result<(), WorkspaceError>;

    /// Commit the resolved merge and publish it to the source branch.
    /// Returns the merge commit sha.
    async fn publish_resolution(
        &self,
        prepared: &PreparedMerge,
        resolved_paths: &[String],
    ) -> Result<String, WorkspaceError>;

    /// Check out the merged target so post-merge gates see it. Falls back to
    /// the target tip when `merge_sha` is unknown. Returns the sha checked out.
    async fn checkout_merged(
        &self,
        prepared: &PreparedMerge,
        merge_sha: Option<&str>,
    ) -> Result<String, WorkspaceError>;

    /// Undo a published merge with a revert commit on the target branch.
    /// Returns the revert commit sha.
    async fn revert_merge(
        &self,
        prepared: &PreparedMerge,
        merge_sha: &str,
    ) -> Result<String, WorkspaceError>;

    /// Remove the worktree and its private branch. Never fails.
    async fn discard(&self, prepared: &PreparedMerge);
}

/// Worktrees of a local clone, created under `worktree_dir`
#[derive(Debug, Clone)]
pub struct Git2Workspace {
    repo_path: PathBuf,
    worktree_dir: PathBuf,
    remote: RemoteAccess,
}

impl Git2Workspace {
    pub fn new(repo_path: impl Into<PathBuf>, worktree_dir: impl Into<PathBuf>) -> Self {
        let worktree_dir = worktree_dir.into();
        Self {
            repo_path: repo_path.into(),
            worktree_dir: std::path::absolute(&worktree_dir).unwrap_or(worktree_dir),
            remote: RemoteAccess::default(),
        }
    }

    pub fn with_remote(mut self, remote: RemoteAccess) -> Self {
        self.remote = remote;
        self
    }

    fn open_blocking(
        &self,
        operation: Uuid,
        change_request: &ChangeRequest,
    ) -> Result<PreparedMerge, WorkspaceError> {
        let repo = Repository::open(&self.repo_path).map_err(|e| WorkspaceError::Unavailable {
            path: self.repo_path.clone(),
            reason: e.message().to_string(),
        })?;
        let source = &change_request.source_branch;
        let target = &change_request.target_branch;
        self.remote.fetch(&repo, &[source.as_str(), target.as_str()])?;
        let source_sha = branch_tip(&repo, source)?;
        // The target has to exist before any gate runs
        branch_tip(&repo, target)?;

        let short: String = operation.simple().to_string().chars().take(12).collect();
        let worktree = format!("{WORKTREE_PREFIX}{short}");
        let branch = format!("{BRANCH_PREFIX}{short}");
        let dir = self.worktree_dir.join(&worktree);
        std::fs::create_dir_all(&self.worktree_dir).map_err(|source| WorkspaceError::Io {
            path: self.worktree_dir.clone(),
            source,
        })?;

        let reference = repo
            .branch(&branch, &repo.find_commit(source_sha)?, true)?
            .into_reference();
        let mut options = WorktreeAddOptions::new();
        options.reference(Some(&reference));
        repo.worktree(&worktree, &dir, Some(&options))?;

        info!(
            change_request = %change_request.id,
            worktree = %dir.display(),
            source_sha = %source_sha,
            "Workspace opened"
        );
        Ok(PreparedMerge {
            operation,
            change_request: change_request.id.clone(),
            dir,
            worktree,
            branch,
            source_branch: source.clone(),
            target_branch: target.clone(),
            source_sha: source_sha.to_string(),
        })
    }

    fn publish_blocking(
        &self,
        prepared: &PreparedMerge,
        resolved_paths: &[String],
    ) -> Result<String, WorkspaceError> {
        let repo = Repository::open(&prepared.dir)?;
        let mut index = repo.index()?;
        for path in resolved_paths {
            index.add_path(Path::new(path))?;
        }
        index.write()?;
        if index.has_conflicts() {
            return Err(WorkspaceError::UnresolvedConflicts(conflicted_paths(&index)?));
        }

        let tree = repo.find_tree(index.write_tree()?)?;
        let target = repo.head()?.peel_to_commit()?;
        let source = repo.find_commit(Oid::from_str(&prepared.source_sha)?)?;
        let signature = signature(&repo)?;
        let message = format!(
            "Merge {} into {}\n\nConflicts in {} resolved automatically for {}.",
            prepared.target_branch,
            prepared.source_branch,
            resolved_paths.join(", "),
            prepared.change_request
        );
        // Lands on the source branch, so the source tip is the first parent
        let oid = repo.commit(None, &signature, &signature, &message, &tree, &[&source, &target])?;
        repo.cleanup_state()?;

        self.remote.publish(&repo, oid, &prepared.source_branch)?;
        Ok(oid.to_string())
    }

    fn checkout_blocking(
        &self,
        prepared: &PreparedMerge,
        merge_sha: Option<&str>,
    ) -> Result<String, WorkspaceError> {
        let repo = Repository::open(&prepared.dir)?;
        self.remote.fetch(&repo, &[prepared.target_branch.as_str()])?;
        repo.cleanup_state()?;

        let known = merge_sha
            .and_then(|sha| Oid::from_str(sha).ok())
            .filter(|oid| repo.find_commit(*oid).is_ok());
        let oid = match known {
            Some(oid) => oid,
            None => branch_tip(&repo, &prepared.target_branch)?,
        };
        let commit = repo.find_commit(oid)?;
        repo.reset(commit.as_object(), ResetType::Hard, None)?;
        debug!(sha = %oid, "Merged target checked out");
        Ok(oid.to_string())
    }

    fn revert_blocking(&self, prepared: &PreparedMerge, merge_sha: &str) -> Result<String, WorkspaceError> {
        let repo = Repository::open(&prepared.dir)?;
        self.remote.fetch(&repo, &[prepared.target_branch.as_str()])?;

        let merged = repo.find_commit(Oid::from_str(merge_sha)?)?;
        let tip = repo.find_commit(branch_tip(&repo, &prepared.target_branch)?)?;
        // Merge commits are reverted against their target-side parent
        let mainline = if merged.parent_count() > 1 { 1 } else { 0 };
        let mut index = repo.revert_commit(&merged, &tip, mainline, None)?;
        if index.has_conflicts() {
            return Err(WorkspaceError::RevertConflict {
                sha: merge_sha.to_string(),
                branch: prepared.target_branch.clone(),
            });
        }

        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        let signature = signature(&repo)?;
        let message = format!(
            "Revert \"{}\"\n\nThis reverts commit {}.\nPost-merge gates failed for {}.",
            merged.summary().unwrap_or("merge"),
            merged.id(),
            prepared.change_request
        );
        let oid = repo.commit(None, &signature, &signature, &message, &tree, &[&tip])?;

        self.remote.publish(&repo, oid, &prepared.target_branch)?;
        info!(merge_sha = %merge_sha, revert_sha = %oid, branch = %prepared.target_branch, "Merge reverted");
        Ok(oid.to_string())
    }

    fn discard_blocking(&self, prepared: &PreparedMerge) -> Result<(), WorkspaceError> {
        let repo = Repository::open(&self.repo_path)?;
        if let Ok(worktree) = repo.find_worktree(&prepared.worktree) {
            let mut options = WorktreePruneOptions::new();
            options.valid(true).locked(true).working_tree(true);
            worktree.prune(Some(&mut options))?;
        }
        if prepared.dir.exists() {
            std::fs::remove_dir_all(&prepared.dir).map_err(|source| WorkspaceError::Io {
                path: prepared.dir.clone(),
                source,
            })?;
        }
        if let Ok(mut branch) = repo.find_branch(&prepared.branch, BranchType::Local) {
            branch.delete()?;
        }
        Ok(())
    }
}

fn merge_blocking(prepared: &PreparedMerge) -> Result<LocalMerge, WorkspaceError> {
    let repo = Repository::open(&prepared.dir)?;
    let target = repo.find_commit(branch_tip(&repo, &prepared.target_branch)?)?;
    let source = Oid::from_str(&prepared.source_sha)?;
    repo.reset(target.as_object(), ResetType::Hard, None)?;

    let annotated = repo.find_annotated_commit(source)?;
    let (analysis, _) = repo.merge_analysis(&[&annotated])?;
    if analysis.is_up_to_date() {
        return Ok(LocalMerge {
            conflicted: Vec::new(),
            up_to_date: true,
        });
    }
    if analysis.is_fast_forward() {
        let commit = repo.find_commit(source)?;
        repo.reset(commit.as_object(), ResetType::Hard, None)?;
        return Ok(LocalMerge::default());
    }

    let mut checkout = CheckoutBuilder::new();
    checkout.allow_conflicts(true).conflict_style_merge(true);
    repo.merge(&[&annotated], None, Some(&mut checkout))?;
    let conflicted = conflicted_paths(&repo.index()?)?;
    debug!(conflicts = conflicted.len(), "Local merge finished");
    Ok(LocalMerge {
        conflicted,
        up_to_date: false,
    })
}

fn conflicted_paths(index: &Index) -> Result<Vec<String>, git2::Error> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
        if let Some(entry) = entry {
            let path = String::from_utf8_lossy(&entry.path).to_string();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    Ok(paths)
}

fn signature(repo: &Repository) -> Result<Signature<'static>, git2::Error> {
    repo.signature()
        .or_else(|_| Signature::now(COMMITTER_NAME, COMMITTER_EMAIL))
}

async fn blocking<T, F>(work: F) -> Result<T, WorkspaceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, WorkspaceError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| WorkspaceError::Task(e.to_string()))?
}

#[async_trait]
impl MergeWorkspace for Git2Workspace {
    async fn open(
        &self,
        operation: Uuid,
        change_request: &ChangeRequest,
    ) -> Result<PreparedMerge, WorkspaceError> {
        let workspace = self.clone();
        let change_request = change_request.clone();
        blocking(move || workspace.open_blocking(operation, &change_request)).await
    }

    async fn merge(&self, prepared: &PreparedMerge) -> Result<LocalMerge, WorkspaceError> {
        let prepared = prepared.clone();
        blocking(move || merge_blocking(&prepared)).await
    }

    async fn read_conflicted(
        &self,
        prepared: &PreparedMerge,
        paths: &[String],
    ) -> Result<Vec<ConflictedResource>, WorkspaceError> {
        let mut resources = Vec::with_capacity(paths.len());
        for path in paths {
            let full = prepared.dir.join(path);
            let content = tokio::fs::read_to_string(&full)
                .await
                .map_err(|source| WorkspaceError::Io { path: full, source })?;
            resources.push(ConflictedResource {
                path: path.clone(),
                content,
            });
        }
        Ok(resources)
    }

    async fn write_resolved(
        &self,
        prepared: &PreparedMerge,
        resolved: &[ResolvedResource],
    ) -> Result<(), WorkspaceError> {
        for resource in resolved {
            let full = prepared.dir.join(&resource.path);
            tokio::fs::write(&full, &resource.content)
                .await
                .map_err(|source| WorkspaceError::Io { path: full, source })?;
            debug!(resource = %resource.path, "Wrote resolved content");
        }
        Ok(())
    }

    async fn publish_resolution(
        &self,
        prepared: &PreparedMerge,
        resolved_paths: &[String],
    ) -> Result<String, WorkspaceError> {
        let workspace = self.clone();
        let prepared = prepared.clone();
        let paths = resolved_paths.to_vec();
        blocking(move || workspace.publish_blocking(&prepared, &paths)).await
    }

    async fn checkout_merged(
        &self,
        prepared: &PreparedMerge,
        merge_sha: Option<&str>,
    ) -> Result<String, WorkspaceError> {
        let workspace = self.clone();
        let prepared = prepared.clone();
        let merge_sha = merge_sha.map(str::to_string);
        blocking(move || workspace.checkout_blocking(&prepared, merge_sha.as_deref())).await
    }

    async fn revert_merge(
        &self,
        prepared: &PreparedMerge,
        merge_sha: &str,
    ) -> Result<String, WorkspaceError> {
        let workspace = self.clone();
        let prepared = prepared.clone();
        let merge_sha = merge_sha.to_string();
        blocking(move || workspace.revert_blocking(&prepared, &merge_sha)).await
    }

    async fn discard(&self, prepared: &PreparedMerge) {
        let workspace = self.clone();
        let owned = prepared.clone();
        if let Err(e) = blocking(move || workspace.discard_blocking(&owned)).await {
            warn!(worktree = %prepared.dir.display(), error = %e, "Could not remove workspace");
        }
    }
}
