//! Isolated workspaces backed by git worktrees.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{BranchType, DiffOptions, DiffStatsFormat, Repository, StatusOptions};

use crate::util::blocking;
use crate::{hlog_debug, hlog_warn, Error, Result};

#[async_trait]
pub trait Workspaces: Send + Sync {
    /// Create a workspace for `label` next to `root` and return its path.
    async fn create(&self, root: &Path, label: &str) -> Result<PathBuf>;

    /// Whether `path` is a workspace registered with the repository at `root`.
    async fn is_workspace(&self, root: &Path, path: &Path) -> Result<bool>;

    /// Remove a workspace. `force` discards uncommitted changes and ignores
    /// the branch still being considered checked out. Paths that are not a
    /// registered workspace are refused.
    async fn remove(&self, root: &Path, path: &Path, force: bool) -> Result<()>;

    /// `git diff --stat` style summary of uncommitted changes.
    async fn diff_summary(&self, path: &Path) -> Result<String>;
}

/// Path of the workspace for `label`: a sibling of `root`.
pub fn workspace_path_for(root: &Path, label: &str) -> PathBuf {
    let dir_name = label.replace('/', "-");
    root.parent().unwrap_or(root).join(dir_name)
}

#[derive(Debug, Clone, Default)]
pub struct GitWorkspaces;

#[async_trait]
impl Workspaces for GitWorkspaces {
    async fn create(&self, root: &Path, label: &str) -> Result<PathBuf> {
        let path = workspace_path_for(root, label);
        let ops = GitOps::new(root)?;
        let branch = label.to_string();
        let target = path.clone();
        blocking(move || ops.create_worktree(&branch, &target)).await?;
        Ok(path)
    }

    async fn is_workspace(&self, root: &Path, path: &Path) -> Result<bool> {
        let ops = GitOps::new(root)?;
        let target = path.to_path_buf();
        blocking(move || Ok(ops.find_worktree(&target)?.is_some())).await
    }

    async fn remove(&self, root: &Path, path: &Path, force: bool) -> Result<()> {
        let ops = GitOps::new(root)?;
        let target = path.to_path_buf();
        blocking(move || ops.remove_worktree(&target, force)).await
    }

    async fn diff_summary(&self, path: &Path) -> Result<String> {
        let target = path.to_path_buf();
        blocking(move || diff_stat(&target)).await
    }
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        hlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Create `branch` from HEAD (or reuse it if a previous dispatch left it
    /// behind) and check it out into a new worktree at `worktree_path`.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        hlog_debug!(
            "GitOps::create_worktree branch={} path={}",
            branch,
            worktree_path.display()
        );
        if worktree_path.exists() {
            return Err(Error::Workspace(format!(
                "Workspace path already exists: {}",
                worktree_path.display()
            )));
        }
        let repo = self.repo()?;
        let branch_obj = match repo.find_branch(branch, BranchType::Local) {
            Ok(existing) => {
                hlog_debug!("Reusing existing branch {}", branch);
                existing
            }
            Err(_) => {
                let commit = repo.head()?.peel_to_commit()?;
                hlog_debug!("Creating branch {} from commit {}", branch, commit.id());
                repo.branch(branch, &commit, false)?
            }
        };
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch may contain slashes; the folder name is the worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        hlog_debug!("Worktree created: {}", worktree_path.display());
        Ok(())
    }

    /// Name of the worktree checked out at `worktree_path`, if git has one
    /// registered there.
    pub fn find_worktree(&self, worktree_path: &Path) -> Result<Option<String>> {
        let repo = self.repo()?;
        registered_worktree(&repo, worktree_path)
    }

    /// Remove a worktree and its admin directory.
    ///
    /// Only a path git has registered as a worktree is touched. Without
    /// `force`, a worktree with uncommitted changes is left alone. With
    /// `force`, every step is attempted even when an earlier one fails, so
    /// git stops treating the branch as checked out.
    pub fn remove_worktree(&self, worktree_path: &Path, force: bool) -> Result<()> {
        hlog_debug!(
            "GitOps::remove_worktree path={} force={}",
            worktree_path.display(),
            force
        );
        let repo = self.repo()?;
        let worktree_name = match registered_worktree(&repo, worktree_path)? {
            Some(name) => Some(name),
            // A stale registration whose directory is already gone.
            None if !worktree_path.exists() => worktree_path
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|name| repo.find_worktree(name).is_ok())
                .map(str::to_string),
            None => None,
        };
        let Some(name) = worktree_name else {
            return Err(Error::Workspace(format!(
                "No worktree at {}",
                worktree_path.display()
            )));
        };

        if !force && worktree_path.exists() && is_dirty(worktree_path)? {
            return Err(Error::Workspace(format!(
                "Workspace has uncommitted changes: {}",
                worktree_path.display()
            )));
        }

        if let Ok(worktree) = repo.find_worktree(&name) {
            let _ = worktree.unlock();
            let prune_result = worktree.prune(Some(
                git2::WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            ));
            if let Err(e) = prune_result {
                hlog_warn!("Worktree prune failed for '{}': {}", name, e);
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover .git/worktrees/<name> keeps the branch "checked out".
        let admin_dir = repo.path().join("worktrees").join(&name);
        if admin_dir.exists() {
            hlog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
            let _ = std::fs::remove_dir_all(&admin_dir);
        }

        hlog_debug!("Worktree removed: {}", worktree_path.display());
        Ok(())
    }
}

fn registered_worktree(repo: &Repository, path: &Path) -> Result<Option<String>> {
    let target = canonical(path);
    let names = repo.worktrees()?;
    let found = names
        .iter()
        .flatten()
        .find(|name| {
            repo.find_worktree(name)
                .map(|wt| canonical(wt.path()) == target)
                .unwrap_or(false)
        })
        .map(str::to_string);
    Ok(found)
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn is_dirty(path: &Path) -> Result<bool> {
    let repo = Repository::open(path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).include_ignored(false);
    let dirty = !repo.statuses(Some(&mut opts))?.is_empty();
    Ok(dirty)
}

fn diff_stat(path: &Path) -> Result<String> {
    let repo = Repository::open(path)?;
    let head_tree = repo.head()?.peel_to_tree()?;
    let mut opts = DiffOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let diff = repo.diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))?;
    let stats = diff.stats()?;
    if stats.files_changed() == 0 {
        return Ok(String::new());
    }
    let buf = stats.to_buf(DiffStatsFormat::FULL, 80)?;
    Ok(buf.as_str().unwrap_or_default().to_string())
}
