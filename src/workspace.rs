//! Owner of the single shared working copy of the source tree.
//!
//! All enhancements mutate the same checkout, serialized by the orchestrator
//! holding a mutex around this manager. Before any job the tree must be
//! clean; after any failure it must be returned to a clean checkout of the
//! base branch, otherwise a crashed mid-commit run corrupts the next job.

use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{BranchType, Cred, FetchOptions, PushOptions, RemoteCallbacks, Repository, ResetType, Signature, StatusOptions};
use tracing::{info, warn};

use crate::errors::WorkspaceError;

const COMMIT_AUTHOR: &str = "conveyor";
const COMMIT_EMAIL: &str = "conveyor@localhost";

/// Convert a title to a branch-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.chars().count() > max_len {
        slug.chars()
            .take(max_len)
            .collect::<String>()
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

/// Deterministic branch name for an enhancement.
pub fn branch_name(enhancement_id: i64, title: &str) -> String {
    format!("enhancement/{}-{}", enhancement_id, slugify(title, 40))
}

#[derive(Debug)]
pub struct WorkspaceManager {
    path: PathBuf,
    base_branch: String,
    /// Token for authenticated fetch/push; filesystem remotes need none.
    token: Option<String>,
}

impl WorkspaceManager {
    pub fn new(path: &Path, base_branch: &str, token: Option<&str>) -> Result<Self, WorkspaceError> {
        // Fail fast if the path is not a repository; later operations reopen it.
        Repository::open(path).map_err(|_| WorkspaceError::NotARepository {
            path: path.display().to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            base_branch: base_branch.to_string(),
            token: token.map(|t| t.to_string()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Repository, WorkspaceError> {
        Repository::open(&self.path).map_err(WorkspaceError::Git)
    }

    fn credential_callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(token) = self.token.clone() {
            callbacks.credentials(move |_url, _username, _allowed| {
                Cred::userpass_plaintext("x-access-token", &token)
            });
        }
        callbacks
    }

    /// Verify a clean working tree, forcing one if necessary.
    ///
    /// A dirty tree here means a previous run crashed mid-job: hard reset to
    /// HEAD and delete untracked files, then check out the base branch. Never
    /// silently ignored; the recovery is logged.
    pub fn ensure_clean(&self) -> Result<(), WorkspaceError> {
        let repo = self.open()?;
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut options))?;

        if !statuses.is_empty() {
            warn!(
                entries = statuses.len(),
                "working tree is dirty, discarding local state before starting"
            );
            let head = repo.head()?.peel(git2::ObjectType::Commit)?;
            repo.reset(&head, ResetType::Hard, None)?;

            // Hard reset leaves untracked files behind; remove them too.
            for entry in statuses.iter() {
                if entry.status().contains(git2::Status::WT_NEW) {
                    if let Some(rel) = entry.path() {
                        let full = self.path.join(rel);
                        if full.is_dir() {
                            let _ = std::fs::remove_dir_all(&full);
                        } else {
                            let _ = std::fs::remove_file(&full);
                        }
                    }
                }
            }
        }

        self.checkout_base()
    }

    /// Fetch the base branch from origin and hard-reset the local base to it,
    /// so new branches always start from the up-to-date base.
    pub fn sync_base(&self) -> Result<(), WorkspaceError> {
        let repo = self.open()?;
        let mut remote = repo.find_remote("origin")?;
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(self.credential_callbacks());
        remote.fetch(
            &[self.base_branch.as_str()],
            Some(&mut fetch_options),
            None,
        )?;

        // libgit2 refuses a force branch update on the current HEAD, so move
        // the checked-out base with a hard reset instead of rewriting the ref.
        self.checkout_base()?;
        let remote_ref = format!("refs/remotes/origin/{}", self.base_branch);
        let commit = repo
            .find_reference(&remote_ref)?
            .peel_to_commit()?;
        repo.reset(commit.as_object(), ResetType::Hard, None)?;
        Ok(())
    }

    pub fn checkout_base(&self) -> Result<(), WorkspaceError> {
        self.checkout_branch(&self.base_branch)
    }

    fn checkout_branch(&self, name: &str) -> Result<(), WorkspaceError> {
        let repo = self.open()?;
        repo.find_branch(name, BranchType::Local)
            .map_err(|_| WorkspaceError::BranchNotFound {
                branch: name.to_string(),
            })?;
        repo.set_head(&format!("refs/heads/{}", name))?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        Ok(())
    }

    /// Create (or recreate) a branch at the tip of the base branch and check
    /// it out.
    pub fn create_branch(&self, name: &str) -> Result<(), WorkspaceError> {
        let repo = self.open()?;
        let base_commit = repo
            .find_branch(&self.base_branch, BranchType::Local)
            .map_err(|_| WorkspaceError::BranchNotFound {
                branch: self.base_branch.clone(),
            })?
            .get()
            .peel_to_commit()?;
        repo.branch(name, &base_commit, true)?;
        self.checkout_branch(name)?;
        info!(branch = name, "created workspace branch");
        Ok(())
    }

    /// Stage exactly the given workspace-relative paths (absent paths are
    /// staged as removals) and commit them with a single message.
    pub fn commit_paths(&self, paths: &[PathBuf], message: &str) -> Result<String, WorkspaceError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        for path in paths {
            if self.path.join(path).exists() {
                index.add_path(path)?;
            } else {
                index.remove_path(path)?;
            }
        }
        index.write()?;
        self.commit_index(&repo, message)
    }

    /// Stage everything (including deletions) and commit.
    pub fn commit_all(&self, message: &str) -> Result<String, WorkspaceError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        self.commit_index(&repo, message)
    }

    fn commit_index(&self, repo: &Repository, message: &str) -> Result<String, WorkspaceError> {
        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now(COMMIT_AUTHOR, COMMIT_EMAIL)?;
        let parent = repo.head()?.peel_to_commit()?;
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        Ok(commit_id.to_string())
    }

    /// Push a branch to origin and record upstream tracking.
    pub fn push(&self, branch: &str) -> Result<(), WorkspaceError> {
        let repo = self.open()?;
        let mut remote = repo.find_remote("origin")?;

        let mut rejection: Option<String> = None;
        {
            let mut callbacks = self.credential_callbacks();
            callbacks.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    rejection = Some(format!("{}: {}", refname, message));
                }
                Ok(())
            });
            let mut push_options = PushOptions::new();
            push_options.remote_callbacks(callbacks);

            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            remote.push(&[refspec.as_str()], Some(&mut push_options))?;
        }
        if let Some(message) = rejection {
            return Err(WorkspaceError::PushRejected {
                branch: branch.to_string(),
                message,
            });
        }

        // Record upstream tracking directly in config; the remote-tracking
        // ref may not exist locally until the next fetch.
        let mut config = repo.config()?;
        config.set_str(&format!("branch.{}.remote", branch), "origin")?;
        config.set_str(
            &format!("branch.{}.merge", branch),
            &format!("refs/heads/{}", branch),
        )?;
        info!(branch, "pushed branch with upstream tracking");
        Ok(())
    }

    /// Recovery path after any failure once a branch exists: discard all
    /// local state, return to the base branch, and drop the local branch so
    /// the next claim starts from a clean workspace.
    pub fn abandon(&self, branch: Option<&str>) -> Result<(), WorkspaceError> {
        self.ensure_clean()?;
        if let Some(name) = branch {
            let repo = self.open()?;
            let stale = repo.find_branch(name, BranchType::Local);
            if let Ok(mut stale) = stale {
                stale.delete()?;
                info!(branch = name, "deleted abandoned branch");
            }
        }
        Ok(())
    }
}
