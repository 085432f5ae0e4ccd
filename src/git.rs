//! Remote plumbing shared by conflict detection and merge workspaces
//!
//! A clone with an `origin` remote is kept current by fetching and updated
//! by pushing. A clone without one is treated as the source of truth and its
//! local branches are moved directly.

use git2::{
    Cred, CredentialType, ErrorCode, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub const REMOTE: &str = "origin";

/// Refs used to stage a push; libgit2 only pushes from references
const STAGING_PREFIX: &str = "refs/merge-conductor/publish";

/// Credentials and serialization for fetches and pushes against `origin`.
/// Clones share one lock so concurrent operations never race on the
/// remote-tracking refs.
#[derive(Debug, Clone, Default)]
pub struct RemoteAccess {
    token: Option<String>,
    lock: Arc<Mutex<()>>,
}

impl RemoteAccess {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|_url, username_from_url, allowed_types| match &self.token {
            Some(token) if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) => {
                Cred::userpass_plaintext("x-access-token", token)
            }
            _ if allowed_types.contains(CredentialType::SSH_KEY) => {
                Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
            }
            _ => Cred::default(),
        });
        callbacks.push_update_reference(|refname, status| match status {
            Some(message) => Err(git2::Error::from_str(&format!(
                "push of {refname} rejected: {message}"
            ))),
            None => Ok(()),
        });
        callbacks
    }

    /// Refresh `origin/<branch>` for each branch. Without an `origin` remote
    /// the local branches are used as they are.
    pub fn fetch(&self, repo: &Repository, branches: &[&str]) -> Result<(), git2::Error> {
        let Some(mut remote) = find_origin(repo)? else {
            return Ok(());
        };
        let refspecs: Vec<String> = branches
            .iter()
            .map(|branch| format!("+refs/heads/{branch}:refs/remotes/{REMOTE}/{branch}"))
            .collect();

        let _serialized = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.callbacks());
        remote.fetch(&refspecs, Some(&mut options), None)?;
        debug!(branches = ?branches, "Fetched from origin");
        Ok(())
    }

    /// Move `branch` to `oid`, on `origin` when there is one. Anything that
    /// is not a fast-forward of the current tip is refused.
    pub fn publish(&self, repo: &Repository, oid: Oid, branch: &str) -> Result<(), git2::Error> {
        let current = branch_tip(repo, branch)?;
        if current != oid && !repo.graph_descendant_of(oid, current)? {
            return Err(git2::Error::from_str(&format!(
                "{oid} is not a fast-forward of {branch} at {current}"
            )));
        }

        match find_origin(repo)? {
            Some(mut remote) => {
                let _serialized = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let staging = format!("{STAGING_PREFIX}/{branch}");
                let mut staged = repo.reference(&staging, oid, true, "merge-conductor: stage push")?;
                let refspec = format!("{staging}:refs/heads/{branch}");
                let mut options = PushOptions::new();
                options.remote_callbacks(self.callbacks());
                let pushed = remote.push(&[refspec.as_str()], Some(&mut options));
                staged.delete()?;
                pushed?;
                repo.reference(
                    &format!("refs/remotes/{REMOTE}/{branch}"),
                    oid,
                    true,
                    "merge-conductor: published",
                )?;
            }
            None => {
                repo.reference(&format!("refs/heads/{branch}"), oid, true, "merge-conductor: published")?;
            }
        }

        info!(branch = %branch, sha = %oid, "Published");
        Ok(())
    }
}

fn find_origin(repo: &Repository) -> Result<Option<git2::Remote<'_>>, git2::Error> {
    match repo.find_remote(REMOTE) {
        Ok(remote) => Ok(Some(remote)),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Tip of `branch`: the `origin/` tracking ref first, then the local branch
pub fn branch_tip(repo: &Repository, branch: &str) -> Result<Oid, git2::Error> {
    repo.refname_to_id(&format!("refs/remotes/{REMOTE}/{branch}"))
        .or_else(|_| repo.refname_to_id(&format!("refs/heads/{branch}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;

    fn commit(repo: &Repository, update_ref: &str, parents: &[Oid], file: &str) -> Oid {
        let mut builder = repo.treebuilder(None).unwrap();
        let blob = repo.blob(file.as_bytes()).unwrap();
        builder.insert("file.txt", blob, 0o100644).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let parents: Vec<git2::Commit> = parents.iter().map(|p| repo.find_commit(*p).unwrap()).collect();
        let parents: Vec<&git2::Commit> = parents.iter().collect();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        repo.commit(Some(update_ref), &sig, &sig, file, &tree, &parents)
            .unwrap()
    }

    #[test]
    fn test_branch_tip_prefers_the_tracking_ref() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let local = commit(&repo, "refs/heads/main", &[], "local");
        assert_eq!(branch_tip(&repo, "main").unwrap(), local);

        let tracked = commit(&repo, "refs/remotes/origin/main", &[local], "tracked");
        assert_eq!(branch_tip(&repo, "main").unwrap(), tracked);
        assert!(branch_tip(&repo, "missing").is_err());
    }

    #[test]
    fn test_publish_without_origin_moves_the_local_branch() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let base = commit(&repo, "refs/heads/main", &[], "base");
        let next = commit(&repo, "refs/heads/scratch", &[base], "next");

        RemoteAccess::default().fetch(&repo, &["main"]).unwrap();
        RemoteAccess::default().publish(&repo, next, "main").unwrap();
        assert_eq!(repo.refname_to_id("refs/heads/main").unwrap(), next);
    }

    #[test]
    fn test_publish_refuses_non_fast_forward() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let base = commit(&repo, "refs/heads/main", &[], "base");
        let sideways = commit(&repo, "refs/heads/other", &[], "unrelated");

        assert!(RemoteAccess::default().publish(&repo, sideways, "main").is_err());
        assert_eq!(repo.refname_to_id("refs/heads/main").unwrap(), base);
    }

    #[test]
    fn test_publish_pushes_to_origin() {
        let upstream_dir = TempDir::new().unwrap();
        let upstream = Repository::init_bare(upstream_dir.path()).unwrap();
        let base = commit(&upstream, "refs/heads/main", &[], "base");

        let clone_dir = TempDir::new().unwrap();
        let clone = Repository::init(clone_dir.path()).unwrap();
        clone
            .remote(REMOTE, &upstream_dir.path().display().to_string())
            .unwrap();
        let access = RemoteAccess::new(None);
        access.fetch(&clone, &["main"]).unwrap();
        assert_eq!(branch_tip(&clone, "main").unwrap(), base);

        let next = commit(&clone, "refs/heads/work", &[base], "next");
        access.publish(&clone, next, "main").unwrap();

        assert_eq!(upstream.refname_to_id("refs/heads/main").unwrap(), next);
        assert_eq!(branch_tip(&clone, "main").unwrap(), next);
        assert!(clone
            .find_reference(&format!("{STAGING_PREFIX}/main"))
            .is_err());
    }
}
