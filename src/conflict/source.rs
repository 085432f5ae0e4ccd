use async_trait::async_trait;
use git2::Repository;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::types::ConflictError;
use crate::git::{branch_tip, RemoteAccess};
use crate::provider::ChangeRequest;

/// Where conflict information comes from: the set of resources changed on
/// the target side since the change request branched off
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ConflictSource: Send + Sync {
    /// Resources modified on the target branch since the merge base
    async fn modified_on_target(
        &self,
        change_request: &ChangeRequest,
    ) -> Result<Vec<String>, ConflictError>;
}

/// Local clone backed conflict source
pub struct Git2ConflictSource {
    repo_path: PathBuf,
    remote: RemoteAccess,
}

impl Git2ConflictSource {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            remote: RemoteAccess::default(),
        }
    }

    /// Fetch through `remote` before diffing
    pub fn with_remote(mut self, remote: RemoteAccess) -> Self {
        self.remote = remote;
        self
    }
}

#[async_trait]
impl ConflictSource for Git2ConflictSource {
    async fn modified_on_target(
        &self,
        change_request: &ChangeRequest,
    ) -> Result<Vec<String>, ConflictError> {
        let repo_path = self.repo_path.clone();
        let remote = self.remote.clone();
        let source = change_request.source_branch.clone();
        let target = change_request.target_branch.clone();

        tokio::task::spawn_blocking(move || modified_paths(&repo_path, &remote, &source, &target))
            .await
            .map_err(|e| ConflictError::SourceUnavailable(e.to_string()))?
    }
}

fn modified_paths(
    repo_path: &Path,
    remote: &RemoteAccess,
    source: &str,
    target: &str,
) -> Result<Vec<String>, ConflictError> {
    let repo = Repository::open(repo_path).map_err(|e| {
        ConflictError::SourceUnavailable(format!("{}: {}", repo_path.display(), e.message()))
    })?;
    if let Err(e) = remote.fetch(&repo, &[source, target]) {
        warn!(error = %e.message(), "Fetch failed, diffing the refs already present");
    }

    let source_commit = repo.find_commit(branch_tip(&repo, source)?)?;
    let target_commit = repo.find_commit(branch_tip(&repo, target)?)?;
    let base = repo.merge_base(source_commit.id(), target_commit.id())?;
    let base_tree = repo.find_commit(base)?.tree()?;
    let target_tree = target_commit.tree()?;

    let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&target_tree), None)?;
    let mut paths: Vec<String> = Vec::new();
    for delta in diff.deltas() {
        for file in [delta.old_file(), delta.new_file()] {
            if let Some(path) = file.path().and_then(|p| p.to_str()) {
                if !paths.iter().any(|p| p == path) {
                    paths.push(path.to_string());
                }
            }
        }
    }

    debug!(
        source = %source,
        target = %target,
        modified = paths.len(),
        "Collected target-side changes since merge base"
    );
    Ok(paths)
}
