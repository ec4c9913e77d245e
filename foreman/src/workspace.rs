//! Workspace provisioning: one git worktree and branch per work item.
//!
//! Layout is fixed: item `N` lives at `<root>/<workspaces_dir>/item-N` on
//! branch `item-N`. Every path is resolved and checked to sit strictly inside
//! the project root before anything touches the filesystem.
//!
//! Git commands that mutate the repository (worktree add/remove/prune, branch
//! delete) take the shared [`RepoMutex`] keyed by the project root. Sleeps and
//! plain filesystem work happen outside the lock.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::naming::{ITEM_PREFIX, branch_name, parse_item_id, workspace_dir_name};
use crate::core::strategy::{
    WORKTREE_STRATEGIES, WorktreeStrategy, classify_worktree_failure, should_fall_through,
};
use crate::error::ForemanError;
use crate::io::config::WorkspaceConfig;
use crate::io::git::{Git, StatusEntry};
use crate::repo_mutex::{RepoMutex, repo_key};

/// A provisioned workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub item_id: u64,
    pub path: PathBuf,
    pub branch: String,
}

/// What `destroy` did. Destroy never fails; problems land in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestroyReport {
    pub item_id: u64,
    pub path: Option<PathBuf>,
    /// Nothing was registered or on disk to begin with.
    pub already_absent: bool,
    pub remove_attempts: u32,
    pub worktree_removed: bool,
    /// The directory survived `worktree remove` and was deleted directly.
    pub dir_fallback: bool,
    pub branch_deleted: bool,
    pub pruned: bool,
    pub errors: Vec<String>,
}

impl DestroyReport {
    fn new(item_id: u64) -> Self {
        Self {
            item_id,
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// What a kept workspace looks like, for inspecting failed agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceSummary {
    pub item_id: u64,
    pub path: PathBuf,
    /// `None` on a detached HEAD.
    pub branch: Option<String>,
    pub changes: Vec<StatusEntry>,
    /// `git diff --stat` against the upstream default branch.
    pub diff_stat: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ids found on disk or in git that belong to a tracked agent.
    pub kept: Vec<u64>,
    /// One report per destroyed orphan, in ascending id order.
    pub destroyed: Vec<DestroyReport>,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn destroyed_ids(&self) -> Vec<u64> {
        self.destroyed.iter().map(|r| r.item_id).collect()
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    root: PathBuf,
    git: Git,
    repo_mutex: RepoMutex,
    config: WorkspaceConfig,
}

impl WorkspaceProvisioner {
    /// `root` must be an existing git checkout; it is canonicalized here.
    pub fn new(root: &Path, config: WorkspaceConfig, repo_mutex: RepoMutex) -> Result<Self> {
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("resolve project root {}", root.display()))?;
        let git = Git::new(&root).with_timeout(config.git_timeout());
        Ok(Self {
            root,
            git,
            repo_mutex,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspaces_root(&self) -> PathBuf {
        resolve_path(&self.root.join(&self.config.workspaces_dir))
    }

    pub fn branch_for(&self, item_id: u64) -> Result<String> {
        branch_name(item_id, self.config.branch_max_len)
    }

    /// Deterministic, validated workspace path for `item_id`.
    ///
    /// Fails with [`ForemanError::Validation`] unless the resolved path is a
    /// strict descendant of the project root.
    pub fn workspace_path(&self, item_id: u64) -> Result<PathBuf> {
        let candidate = self
            .root
            .join(&self.config.workspaces_dir)
            .join(workspace_dir_name(item_id));
        let resolved = resolve_path(&candidate);
        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(ForemanError::validation(format!(
                "workspace {} resolves to {}, outside project root {}",
                candidate.display(),
                resolved.display(),
                self.root.display()
            ))
            .into());
        }
        Ok(resolved)
    }

    /// Create a fresh worktree for `item_id`, replacing any leftover one.
    #[instrument(skip_all, fields(item_id))]
    pub async fn provision(&self, item_id: u64) -> Result<Workspace> {
        let path = self.workspace_path(item_id)?;
        let branch = self.branch_for(item_id)?;

        let mut leftover = DestroyReport::new(item_id);
        self.remove_workspace(&path, &mut leftover).await;
        if !leftover.already_absent {
            info!(path = %path.display(), "replaced leftover workspace");
            let _guard = self.repo_mutex.lock_repo(&self.root).await;
            self.git.worktree_prune().await?;
        }
        if path.exists() {
            return Err(ForemanError::WorkspaceState(format!(
                "could not clear {}: {}",
                path.display(),
                leftover.errors.join("; ")
            ))
            .into());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        let base = self.git.upstream_default_branch().await?;
        if base.starts_with("origin/") {
            let _guard = self.repo_mutex.lock_repo(&self.root).await;
            self.git.fetch("origin").await?;
        }
        self.add_worktree(&path, &branch, &base).await?;
        self.copy_local_files(&path).await;

        info!(path = %path.display(), branch = %branch, base = %base, "workspace provisioned");
        Ok(Workspace {
            item_id,
            path,
            branch,
        })
    }

    async fn add_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let mut last_detail = String::new();
        for strategy in WORKTREE_STRATEGIES {
            let force = strategy == WorktreeStrategy::ForceRecreateBranch;
            let output = {
                let _guard = self.repo_mutex.lock_repo(&self.root).await;
                self.git.worktree_add(path, branch, base, force).await?
            };
            if output.success() {
                debug!(strategy = strategy.as_str(), "worktree added");
                return Ok(());
            }
            let detail = output.detail();
            let mode = classify_worktree_failure(&detail);
            warn!(
                strategy = strategy.as_str(),
                mode = ?mode,
                detail = %detail,
                "worktree add failed"
            );
            last_detail = detail;
            if !should_fall_through(strategy, mode) {
                break;
            }
        }
        Err(ForemanError::TransientTool {
            command: format!("git worktree add {}", path.display()),
            detail: last_detail,
        }
        .into())
    }

    /// Copy allow-listed local files from the root. Failures are skipped.
    async fn copy_local_files(&self, workspace: &Path) {
        for rel in &self.config.copy_files {
            let rel_path = Path::new(rel);
            if rel_path.is_absolute()
                || rel_path
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
            {
                warn!(file = %rel, "skipping copy entry outside the project");
                continue;
            }
            let src = self.root.join(rel_path);
            if !src.is_file() {
                continue;
            }
            let dst = workspace.join(rel_path);
            if let Some(parent) = dst.parent()
                && let Err(err) = tokio::fs::create_dir_all(parent).await
            {
                warn!(file = %rel, err = %err, "failed to create directory for copied file");
                continue;
            }
            match tokio::fs::copy(&src, &dst).await {
                Ok(_) => debug!(file = %rel, "copied local file into workspace"),
                Err(err) => warn!(file = %rel, err = %err, "failed to copy local file"),
            }
        }
    }

    /// Branch, pending changes, and diff of the workspace for `item_id`, or
    /// `None` when there is no workspace on disk.
    pub async fn inspect(&self, item_id: u64) -> Result<Option<WorkspaceSummary>> {
        let path = self.workspace_path(item_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let git = self.git.with_dir(&path);
        let toplevel = git.toplevel().await?;
        if repo_key(&toplevel) != repo_key(&path) {
            return Err(ForemanError::WorkspaceState(format!(
                "{} is not a worktree (top level is {})",
                path.display(),
                toplevel.display()
            ))
            .into());
        }
        let branch = git.current_branch().await.ok();
        let changes = git.status_porcelain().await?;
        let base = self.git.upstream_default_branch().await?;
        let diff_stat = git.diff_stat(&base).await?;
        Ok(Some(WorkspaceSummary {
            item_id,
            path,
            branch,
            changes,
            diff_stat,
        }))
    }

    /// Remove the workspace and branch for `item_id`. Never fails; safe to
    /// call repeatedly.
    #[instrument(skip_all, fields(item_id))]
    pub async fn destroy(&self, item_id: u64) -> DestroyReport {
        let mut report = DestroyReport::new(item_id);
        let path = match self.workspace_path(item_id) {
            Ok(path) => path,
            Err(err) => {
                report.errors.push(format!("{err:#}"));
                return report;
            }
        };
        self.remove_workspace(&path, &mut report).await;
        report.path = Some(path);

        match self.branch_for(item_id) {
            Ok(branch) => {
                let deleted = {
                    let _guard = self.repo_mutex.lock_repo(&self.root).await;
                    self.git.delete_branch(&branch).await
                };
                match deleted {
                    Ok(deleted) => report.branch_deleted = deleted,
                    Err(err) => report.errors.push(format!("delete branch {branch}: {err:#}")),
                }
            }
            Err(err) => report.errors.push(format!("{err:#}")),
        }

        let pruned = {
            let _guard = self.repo_mutex.lock_repo(&self.root).await;
            self.git.worktree_prune().await
        };
        match pruned {
            Ok(()) => report.pruned = true,
            Err(err) => report.errors.push(format!("worktree prune: {err:#}")),
        }

        if report.is_clean() {
            info!(
                already_absent = report.already_absent,
                branch_deleted = report.branch_deleted,
                "workspace destroyed"
            );
        } else {
            warn!(errors = ?report.errors, "workspace destroyed with errors");
        }
        report
    }

    /// Unregister and delete the worktree at `path`, falling back to a plain
    /// directory removal.
    async fn remove_workspace(&self, path: &Path, report: &mut DestroyReport) {
        let registered = match self.is_registered(path).await {
            Ok(registered) => registered,
            Err(err) => {
                debug!(err = %err, "worktree list failed, assuming registered");
                true
            }
        };
        let on_disk = path.exists();
        if !registered && !on_disk {
            report.already_absent = true;
            return;
        }

        if registered {
            let attempts = self.config.remove_attempts.max(1);
            for attempt in 1..=attempts {
                report.remove_attempts = attempt;
                let result = {
                    let _guard = self.repo_mutex.lock_repo(&self.root).await;
                    self.git.worktree_remove(path).await
                };
                let detail = match result {
                    Ok(output) if output.success() => {
                        report.worktree_removed = true;
                        break;
                    }
                    Ok(output) => output.detail(),
                    Err(err) => format!("{err:#}"),
                };
                // Another process may have removed it between our calls.
                if let Ok(false) = self.is_registered(path).await {
                    debug!(attempt, "worktree already unregistered");
                    report.worktree_removed = true;
                    break;
                }
                if attempt == attempts {
                    report
                        .errors
                        .push(format!("worktree remove failed after {attempt} attempts: {detail}"));
                } else {
                    debug!(attempt, detail = %detail, "worktree remove failed, retrying");
                    tokio::time::sleep(self.config.remove_backoff() * attempt).await;
                }
            }
        }

        tokio::time::sleep(self.config.settle()).await;
        if path.exists() {
            report.dir_fallback = true;
            if let Err(err) = tokio::fs::remove_dir_all(path).await {
                report
                    .errors
                    .push(format!("remove {}: {err}", path.display()));
            } else {
                debug!(path = %path.display(), "removed workspace directory directly");
            }
        }
    }

    async fn is_registered(&self, path: &Path) -> Result<bool> {
        let key = repo_key(path);
        let entries = self.git.worktree_list().await?;
        Ok(entries
            .iter()
            .any(|entry| entry.path == path || repo_key(&entry.path) == key))
    }

    /// Destroy every workspace or branch whose item id is not tracked.
    ///
    /// Ids are collected from `item-*` directories, registered worktrees under
    /// the workspaces dir, and local `item-*` branches, then destroyed once
    /// each in ascending order.
    #[instrument(skip_all)]
    pub async fn sweep_orphans<F>(&self, is_tracked: F) -> SweepReport
    where
        F: Fn(u64) -> bool,
    {
        let mut report = SweepReport::default();
        let mut ids = BTreeSet::new();
        let workspaces_root = self.workspaces_root();

        match tokio::fs::read_dir(&workspaces_root).await {
            Ok(mut dir) => loop {
                match dir.next_entry().await {
                    Ok(Some(entry)) => {
                        if let Some(id) = entry.file_name().to_str().and_then(parse_item_id) {
                            ids.insert(id);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        report.errors.push(format!("read workspaces dir: {err}"));
                        break;
                    }
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => report
                .errors
                .push(format!("read {}: {err}", workspaces_root.display())),
        }

        match self.git.worktree_list().await {
            Ok(entries) => {
                for entry in entries {
                    let under_root = entry
                        .path
                        .parent()
                        .is_some_and(|parent| resolve_path(parent) == workspaces_root);
                    if !under_root {
                        continue;
                    }
                    if let Some(id) = entry
                        .path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .and_then(parse_item_id)
                    {
                        ids.insert(id);
                    }
                }
            }
            Err(err) => report.errors.push(format!("worktree list: {err:#}")),
        }

        match self.git.list_branches_with_prefix(ITEM_PREFIX).await {
            Ok(branches) => ids.extend(branches.iter().filter_map(|b| parse_item_id(b))),
            Err(err) => report.errors.push(format!("list branches: {err:#}")),
        }

        for id in ids {
            if is_tracked(id) {
                report.kept.push(id);
                continue;
            }
            info!(item_id = id, "destroying orphaned workspace");
            report.destroyed.push(self.destroy(id).await);
        }
        info!(
            destroyed = report.destroyed.len(),
            kept = report.kept.len(),
            "orphan sweep finished"
        );
        report
    }
}

/// Resolve symlinks and `..` for a path that may not exist yet.
///
/// The deepest existing ancestor is canonicalized; the remaining components
/// are applied lexically (they cannot be symlinks since they do not exist).
fn resolve_path(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(&existing) {
            let mut out = canonical;
            for component in rest.iter().rev() {
                out.push(component);
            }
            return normalize_lexically(&out);
        }
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return normalize_lexically(path),
        }
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_dot_and_dotdot() {
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
    }

    #[test]
    fn resolve_handles_missing_tail_with_parent_refs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = std::fs::canonicalize(temp.path()).expect("canonical");
        let resolved = resolve_path(&root.join("missing/../../escape/item-1"));
        assert_eq!(
            resolved,
            root.parent().expect("parent").join("escape/item-1")
        );
    }

    #[cfg(unix)]
    #[test]
    fn resolve_follows_existing_symlinks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = std::fs::canonicalize(temp.path()).expect("canonical");
        let outside = root.join("outside");
        std::fs::create_dir(&outside).expect("mkdir");
        std::os::unix::fs::symlink(&outside, root.join("link")).expect("symlink");
        assert_eq!(resolve_path(&root.join("link/item-3")), outside.join("item-3"));
    }
}
