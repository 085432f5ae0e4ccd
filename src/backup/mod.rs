//! Pre-merge backups and rollback
//!
//! A snapshot of a working tree prefers a backup branch at its HEAD (full
//! history). When the tree is not a repository the essential files are
//! copied under the state directory instead. Restore tries a hard reset of
//! the same tree first and falls back to copying files back.

pub mod types;

use async_trait::async_trait;
use chrono::Utc;
use git2::{BranchType, Oid, Repository, ResetType, StatusOptions};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use types::{BackupError, BackupHandle, BackupMethod, RepositoryStatus, RestoreOutcome};

const BACKUP_ID_PREFIX: &str = "merge-conductor-";
const BACKUP_BRANCH_PREFIX: &str = "backup/";

pub fn default_essential_patterns() -> Vec<String> {
    vec![
        r"^Cargo\.(toml|lock)$".to_string(),
        r"\.(toml|json|ya?ml|md)$".to_string(),
        r"^src/".to_string(),
    ]
}

/// Snapshot and restore seam used by the merge coordinator
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SnapshotManager: Send + Sync {
    /// Back up the working tree at `workdir`
    async fn snapshot(&self, workdir: &Path) -> Result<BackupHandle, BackupError>;

    /// Roll the tree recorded in `handle` back. Never errors; failures are
    /// reported in the outcome.
    async fn restore(&self, handle: &BackupHandle) -> RestoreOutcome;

    /// Delete all but the newest `keep` backups, returning how many went
    async fn prune(&self, keep: usize) -> Result<usize, BackupError>;
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    /// Clone whose backup branches are pruned
    repo_path: PathBuf,
    backup_dir: PathBuf,
    essential_patterns: Vec<Regex>,
}

impl BackupManager {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        essential_patterns: &[String],
    ) -> Result<Self, BackupError> {
        let essential_patterns = essential_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| BackupError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            repo_path: repo_path.into(),
            backup_dir: backup_dir.into(),
            essential_patterns,
        })
    }

    fn snapshot_blocking(&self, workdir: &Path) -> Result<BackupHandle, BackupError> {
        let timestamp = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!(
            "{BACKUP_ID_PREFIX}{}-{}",
            timestamp.format("%Y%m%dT%H%M%S%3f"),
            &suffix[..8]
        );
        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let (location, method, status) = match full_history_snapshot(workdir, &id) {
            Ok((location, status)) => (location, BackupMethod::FullHistory, status),
            Err(git_error) => {
                warn!(
                    repository = ?workdir,
                    error = %git_error.message(),
                    "Repository unreachable, falling back to file copy backup"
                );
                let location = self.file_copy_snapshot(workdir, &id).map_err(|copy_error| {
                    BackupError::BackupUnavailable(format!(
                        "full history: {}; file copy: {copy_error}",
                        git_error.message()
                    ))
                })?;
                (location, BackupMethod::FileCopy, RepositoryStatus::default())
            }
        };

        info!(backup_id = %id, method = %method, location = %location, "Backup created");
        Ok(BackupHandle {
            id,
            timestamp,
            repository: workdir.to_path_buf(),
            location,
            method,
            status,
            host,
            restore_method: None,
        })
    }

    fn file_copy_snapshot(&self, workdir: &Path, id: &str) -> Result<String, BackupError> {
        if !workdir.is_dir() {
            return Err(BackupError::BackupUnavailable(format!(
                "repository path {} does not exist",
                workdir.display()
            )));
        }

        let mut files = Vec::new();
        collect_files(workdir, workdir, &mut files).map_err(|source| BackupError::Io {
            path: workdir.to_path_buf(),
            source,
        })?;
        files.retain(|rel| {
            let rel = normalized(rel);
            self.essential_patterns.iter().any(|re| re.is_match(&rel))
        });
        if files.is_empty() {
            return Err(BackupError::BackupUnavailable(format!(
                "no essential files under {}",
                workdir.display()
            )));
        }

        let destination = self.backup_dir.join(id);
        copy_tree(workdir, &destination, &files)?;
        debug!(backup_id = %id, files = files.len(), "Essential files copied");
        Ok(destination.display().to_string())
    }

    fn restore_blocking(&self, handle: &BackupHandle) -> RestoreOutcome {
        let mut errors = Vec::new();

        match self.reset_to_backup(handle) {
            Ok(()) => {
                info!(backup_id = %handle.id, "Repository restored by hard reset");
                return RestoreOutcome {
                    success: true,
                    method: Some(BackupMethod::FullHistory),
                    errors,
                };
            }
            Err(e) => errors.push(format!("full history restore failed: {e}")),
        }

        match self.copy_back(handle) {
            Ok(count) => {
                info!(backup_id = %handle.id, files = count, "Repository restored from file copy");
                RestoreOutcome {
                    success: true,
                    method: Some(BackupMethod::FileCopy),
                    errors,
                }
            }
            Err(e) => {
                errors.push(format!("file copy restore failed: {e}"));
                warn!(backup_id = %handle.id, errors = ?errors, "Restore failed");
                RestoreOutcome {
                    success: false,
                    method: None,
                    errors,
                }
            }
        }
    }

    /// Handles written before the tree was recorded restore the clone
    fn tree_of<'a>(&'a self, handle: &'a BackupHandle) -> &'a Path {
        if handle.repository.as_os_str().is_empty() {
            &self.repo_path
        } else {
            &handle.repository
        }
    }

    fn reset_to_backup(&self, handle: &BackupHandle) -> Result<(), BackupError> {
        let repo = Repository::open(self.tree_of(handle))?;
        let recorded = handle
            .status
            .head
            .as_deref()
            .and_then(|head| Oid::from_str(head).ok())
            .and_then(|oid| repo.find_commit(oid).ok());

        let commit = match recorded {
            Some(commit) => commit,
            None if handle.method == BackupMethod::FullHistory => {
                repo.revparse_single(&handle.location)?.peel_to_commit()?
            }
            None => {
                return Err(BackupError::BackupUnavailable(format!(
                    "no commit recorded for {}",
                    handle.id
                )))
            }
        };

        repo.reset(commit.as_object(), ResetType::Hard, None)?;
        Ok(())
    }

    fn copy_back(&self, handle: &BackupHandle) -> Result<usize, BackupError> {
        let source = self.backup_dir.join(&handle.id);
        if !source.is_dir() {
            return Err(BackupError::BackupUnavailable(format!(
                "no file copy at {}",
                source.display()
            )));
        }

        let mut files = Vec::new();
        collect_files(&source, &source, &mut files).map_err(|e| BackupError::Io {
            path: source.clone(),
            source: e,
        })?;
        copy_tree(&source, self.tree_of(handle), &files)?;
        Ok(files.len())
    }

    fn prune_blocking(&self, keep: usize) -> Result<usize, BackupError> {
        let mut removed = 0;

        if self.backup_dir.is_dir() {
            let entries = std::fs::read_dir(&self.backup_dir).map_err(|source| BackupError::Io {
                path: self.backup_dir.clone(),
                source,
            })?;
            let mut copies: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.is_dir()
                        && path
                            .file_name()
                            .is_some_and(|name| name.to_string_lossy().starts_with(BACKUP_ID_PREFIX))
                })
                .collect();
            copies.sort();
            let excess = copies.len().saturating_sub(keep);
            for path in copies.into_iter().take(excess) {
                std::fs::remove_dir_all(&path).map_err(|source| BackupError::Io {
                    path: path.clone(),
                    source,
                })?;
                removed += 1;
            }
        }

        if let Ok(repo) = Repository::open(&self.repo_path) {
            let prefix = format!("{BACKUP_BRANCH_PREFIX}{BACKUP_ID_PREFIX}");
            let mut names: Vec<String> = repo
                .branches(Some(BranchType::Local))?
                .filter_map(|branch| branch.ok())
                .filter_map(|(branch, _)| branch.name().ok().flatten().map(str::to_string))
                .filter(|name| name.starts_with(&prefix))
                .collect();
            names.sort();
            let excess = names.len().saturating_sub(keep);
            for name in names.into_iter().take(excess) {
                let deleted = repo
                    .find_branch(&name, BranchType::Local)
                    .and_then(|mut branch| branch.delete());
                match deleted {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(branch = %name, error = %e.message(), "Could not delete backup branch"),
                }
            }
        }

        if removed > 0 {
            info!(removed, keep, "Pruned old backups");
        }
        Ok(removed)
    }
}

#[async_trait]
impl SnapshotManager for BackupManager {
    async fn snapshot(&self, workdir: &Path) -> Result<BackupHandle, BackupError> {
        let manager = self.clone();
        let workdir = workdir.to_path_buf();
        tokio::task::spawn_blocking(move || manager.snapshot_blocking(&workdir))
            .await
            .map_err(|e| BackupError::BackupUnavailable(e.to_string()))?
    }

    async fn restore(&self, handle: &BackupHandle) -> RestoreOutcome {
        let manager = self.clone();
        let handle = handle.clone();
        match tokio::task::spawn_blocking(move || manager.restore_blocking(&handle)).await {
            Ok(outcome) => outcome,
            Err(e) => RestoreOutcome {
                success: false,
                method: None,
                errors: vec![format!("restore task failed: {e}")],
            },
        }
    }

    /// Prunes both file copies and backup branches
    async fn prune(&self, keep: usize) -> Result<usize, BackupError> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.prune_blocking(keep))
            .await
            .map_err(|e| BackupError::BackupUnavailable(e.to_string()))?
    }
}

fn full_history_snapshot(workdir: &Path, id: &str) -> Result<(String, RepositoryStatus), git2::Error> {
    let repo = Repository::open(workdir)?;
    let head = repo.head()?;
    let commit = head.peel_to_commit()?;
    let branch = head
        .shorthand()
        .filter(|name| *name != "HEAD")
        .map(str::to_string);

    let mut options = StatusOptions::new();
    options.include_untracked(true).recurse_untracked_dirs(true);
    let dirty_paths = repo
        .statuses(Some(&mut options))?
        .iter()
        .filter_map(|entry| entry.path().map(str::to_string))
        .collect();

    let branch_name = format!("{BACKUP_BRANCH_PREFIX}{id}");
    repo.branch(&branch_name, &commit, false)?;

    Ok((
        format!("refs/heads/{branch_name}"),
        RepositoryStatus {
            head: Some(commit.id().to_string()),
            branch,
            dirty_paths,
        },
    ))
}

/// Regular files under `dir`, relative to `root`. Hidden directories and
/// `target/` are skipped.
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == "target" {
                continue;
            }
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path, files: &[PathBuf]) -> Result<(), BackupError> {
    for rel in files {
        let target = to.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|source| BackupError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::copy(from.join(rel), &target).map_err(|source| BackupError::Io {
            path: target.clone(),
            source,
        })?;
    }
    Ok(())
}

fn normalized(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;

    fn commit_all(repo: &Repository, message: &str) -> Oid {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }

    fn manager(repo: &Path, backups: &Path) -> BackupManager {
        BackupManager::new(repo, backups, &default_essential_patterns()).unwrap()
    }

    #[tokio::test]
    async fn test_full_history_snapshot_and_restore() {
        let dir = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nversion = \"1\"\n").unwrap();
        let original = commit_all(&repo, "initial");

        let manager = manager(dir.path(), backups.path());
        let handle = manager.snapshot(dir.path()).await.unwrap();
        assert_eq!(handle.method, BackupMethod::FullHistory);
        assert_eq!(handle.status.head, Some(original.to_string()));
        assert!(handle.location.starts_with("refs/heads/backup/merge-conductor-"));
        assert!(repo.find_reference(&handle.location).is_ok());

        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nversion = \"2\"\n").unwrap();
        commit_all(&repo, "merge");

        let outcome = manager.restore(&handle).await;
        assert!(outcome.success);
        assert_eq!(outcome.method, Some(BackupMethod::FullHistory));
        assert_eq!(repo.head().unwrap().peel_to_commit().unwrap().id(), original);
        assert!(std::fs::read_to_string(dir.path().join("Cargo.toml"))
            .unwrap()
            .contains("version = \"1\""));
    }

    #[tokio::test]
    async fn test_restore_targets_the_snapshotted_tree() {
        let clone = TempDir::new().unwrap();
        let tree = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let clone_repo = Repository::init(clone.path()).unwrap();
        std::fs::write(clone.path().join("Cargo.toml"), "clone\n").unwrap();
        let clone_head = commit_all(&clone_repo, "clone");
        let repo = Repository::init(tree.path()).unwrap();
        std::fs::write(tree.path().join("Cargo.toml"), "before\n").unwrap();
        let before = commit_all(&repo, "before");

        let manager = manager(clone.path(), backups.path());
        let handle = manager.snapshot(tree.path()).await.unwrap();
        assert_eq!(handle.repository, tree.path());

        std::fs::write(tree.path().join("Cargo.toml"), "after\n").unwrap();
        commit_all(&repo, "after");
        assert!(manager.restore(&handle).await.success);

        assert_eq!(repo.head().unwrap().peel_to_commit().unwrap().id(), before);
        assert_eq!(clone_repo.head().unwrap().peel_to_commit().unwrap().id(), clone_head);
    }

    #[tokio::test]
    async fn test_file_copy_fallback_outside_a_repository() {
        let dir = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "original").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn a() {}").unwrap();
        std::fs::write(dir.path().join("logo.png"), [0u8; 4]).unwrap();

        let manager = manager(dir.path(), backups.path());
        let handle = manager.snapshot(dir.path()).await.unwrap();
        assert_eq!(handle.method, BackupMethod::FileCopy);
        assert!(handle.status.head.is_none());
        let copy = backups.path().join(&handle.id);
        assert!(copy.join("Cargo.toml").exists());
        assert!(copy.join("src/lib.rs").exists());
        assert!(!copy.join("logo.png").exists());

        std::fs::write(dir.path().join("Cargo.toml"), "broken").unwrap();
        let outcome = manager.restore(&handle).await;
        assert!(outcome.success);
        assert_eq!(outcome.method, Some(BackupMethod::FileCopy));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Cargo.toml")).unwrap(),
            "original"
        );
    }

    #[tokio::test]
    async fn test_nothing_to_back_up_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let manager = manager(&missing, &dir.path().join("backups"));
        assert!(matches!(
            manager.snapshot(&missing).await,
            Err(BackupError::BackupUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_fails_when_both_methods_fail() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "x").unwrap();
        let manager = manager(dir.path(), &dir.path().join(".backups"));
        let handle = manager.snapshot(dir.path()).await.unwrap();
        std::fs::remove_dir_all(dir.path().join(".backups")).unwrap();

        let outcome = manager.restore(&handle).await;
        assert!(!outcome.success);
        assert!(outcome.method.is_none());
        assert_eq!(outcome.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_copies() {
        let dir = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "x").unwrap();
        let manager = manager(dir.path(), backups.path());
        for _ in 0..3 {
            manager.snapshot(dir.path()).await.unwrap();
        }

        assert_eq!(manager.prune(1).await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(backups.path()).unwrap().count(), 1);
        assert_eq!(manager.prune(1).await.unwrap(), 0);
    }

    #[test]
    fn test_invalid_essential_pattern() {
        assert!(matches!(
            BackupManager::new(".", ".", &["(".to_string()]),
            Err(BackupError::InvalidPattern { .. })
        ));
    }
}
