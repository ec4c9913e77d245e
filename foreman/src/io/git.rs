//! Git adapter for workspace provisioning.
//!
//! Everything goes through the `git` binary. Commands that mutate shared
//! repository state (worktrees, branches) are expected to run under
//! `RepoMutex`; this wrapper does not lock on its own.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::ForemanError;
use crate::io::process::{CommandOutput, run_command};

const GIT_TIMEOUT: Duration = Duration::from_secs(120);
const GIT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name (`refs/heads/` stripped); `None` when detached.
    pub branch: Option<String>,
    pub prunable: bool,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same settings, different working directory.
    pub fn with_dir(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: dir.into(),
            timeout: self.timeout,
        }
    }

    /// Absolute path of the repository top level.
    pub async fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"]).await?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Resolve a path inside the git dir (`rev-parse --git-path`).
    ///
    /// For a linked worktree this resolves shared files such as `info/exclude`
    /// against the common dir.
    pub async fn git_path(&self, name: &str) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-path", name]).await?;
        let path = PathBuf::from(out.trim());
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(self.workdir.join(path))
        }
    }

    /// Current branch name (errors on detached HEAD).
    pub async fn current_branch(&self) -> Result<String> {
        let out = self
            .run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Err(anyhow!("detached HEAD"));
        }
        Ok(name)
    }

    pub async fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self
            .run_capture(&["status", "--porcelain=v1", "-uall"])
            .await?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// `git diff --stat <base>...HEAD`.
    pub async fn diff_stat(&self, base: &str) -> Result<String> {
        let range = format!("{base}...HEAD");
        self.run_capture(&["diff", "--stat", &range]).await
    }

    /// Best-effort `git fetch <remote>`; returns whether it succeeded.
    #[instrument(skip_all, fields(remote))]
    pub async fn fetch(&self, remote: &str) -> Result<bool> {
        let output = self.run(&["fetch", "--quiet", remote]).await?;
        if !output.success() {
            warn!(remote, detail = %output.detail(), "git fetch failed");
        }
        Ok(output.success())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        self.ref_exists(&format!("refs/heads/{branch}")).await
    }

    async fn ref_exists(&self, full_ref: &str) -> Result<bool> {
        let output = self
            .run(&["show-ref", "--verify", "--quiet", full_ref])
            .await?;
        Ok(output.success())
    }

    /// Local branches whose short name starts with `prefix`.
    pub async fn list_branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("refs/heads/{prefix}*");
        let out = self
            .run_capture(&["for-each-ref", "--format=%(refname:short)", &pattern])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `git branch -D <branch>`. Returns false when git refused (missing
    /// branch, checked out elsewhere).
    #[instrument(skip_all, fields(branch))]
    pub async fn delete_branch(&self, branch: &str) -> Result<bool> {
        let output = self.run(&["branch", "-D", branch]).await?;
        if !output.success() {
            debug!(branch, detail = %output.detail(), "branch delete refused");
        }
        Ok(output.success())
    }

    /// Branch that new work should start from.
    ///
    /// Tries `origin/HEAD`, then `origin/main`, `origin/master`, then a local
    /// `main`/`master`, and finally `HEAD`.
    #[instrument(skip_all)]
    pub async fn upstream_default_branch(&self) -> Result<String> {
        let symbolic = self
            .run(&["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"])
            .await?;
        if symbolic.success() {
            let name = symbolic.stdout_lossy().trim().to_string();
            if !name.is_empty() {
                debug!(branch = %name, "default branch from origin/HEAD");
                return Ok(name);
            }
        }
        for candidate in ["origin/main", "origin/master"] {
            if self
                .ref_exists(&format!("refs/remotes/{candidate}"))
                .await?
            {
                return Ok(candidate.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate).await? {
                return Ok(candidate.to_string());
            }
        }
        debug!("no default branch found, using HEAD");
        Ok("HEAD".to_string())
    }

    /// `git worktree add` binding `branch` at `base`.
    ///
    /// `force` selects `-B` (reset an existing branch) over `-b`. The raw
    /// output is returned so callers can classify failures.
    #[instrument(skip_all, fields(path = %path.display(), branch, base, force))]
    pub async fn worktree_add(
        &self,
        path: &Path,
        branch: &str,
        base: &str,
        force: bool,
    ) -> Result<CommandOutput> {
        let path_str = path_str(path)?;
        let flag = if force { "-B" } else { "-b" };
        self.run(&["worktree", "add", flag, branch, path_str, base])
            .await
    }

    pub async fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self
            .run_capture(&["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&out))
    }

    /// `git worktree remove --force <path>`, returning raw output.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn worktree_remove(&self, path: &Path) -> Result<CommandOutput> {
        let path_str = path_str(path)?;
        self.run(&["worktree", "remove", "--force", path_str]).await
    }

    pub async fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"]).await?;
        Ok(())
    }

    async fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args).await?;
        Ok(output.stdout_lossy())
    }

    async fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args).await?;
        if !output.success() {
            return Err(ForemanError::TransientTool {
                command: format!("git {}", args.join(" ")),
                detail: output.detail(),
            }
            .into());
        }
        Ok(output)
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        debug!(args = ?args, dir = %self.workdir.display(), "running git");
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command(cmd, self.timeout, GIT_OUTPUT_LIMIT)
            .await
            .with_context(|| format!("git {}", args.join(" ")))
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path: {}", path.display()))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_worktree_list(out: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in out.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                prunable: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(short.to_string());
        } else if line.starts_with("prunable") {
            entry.prunable = true;
        }
    }
    entries.extend(current);
    entries
}
