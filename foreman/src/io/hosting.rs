//! Hosting-platform adapter (work items and completion artifacts).
//!
//! The orchestrator only needs three calls, so the platform sits behind a
//! small trait. `GhCli` implements it with the `gh` binary; tests use an
//! in-memory fake from `test_support`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::core::linking::find_artifact_url;
use crate::core::types::WorkItem;
use crate::error::ForemanError;
use crate::io::process::run_command;

const GH_TIMEOUT: Duration = Duration::from_secs(60);
const GH_OUTPUT_LIMIT: usize = 4 * 1024 * 1024;
const LIST_LIMIT: &str = "200";

/// A completion artifact as the platform reports it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteArtifact {
    pub number: u64,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "headRefName", default)]
    pub head_branch: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRequest {
    pub item_id: u64,
    pub title: String,
    pub body: String,
    pub head: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { number: u64, url: String },
    /// The platform already has an artifact for this head branch.
    AlreadyExists { detail: String },
}

#[async_trait]
pub trait HostingPlatform: Send + Sync {
    async fn fetch_item(&self, item_id: u64) -> Result<WorkItem>;

    /// All artifacts, regardless of state.
    async fn list_artifacts(&self) -> Result<Vec<RemoteArtifact>>;

    async fn create_artifact(&self, request: &ArtifactRequest) -> Result<CreateOutcome>;
}

/// `gh`-backed platform rooted at a local checkout.
#[derive(Debug, Clone)]
pub struct GhCli {
    repo_root: PathBuf,
    program: String,
}

impl GhCli {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            program: "gh".to_string(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn run_gh(&self, args: &[&str]) -> Result<Result<String, String>> {
        debug!(args = ?args, "running gh");
        let mut cmd = Command::new(&self.program);
        cmd.args(args).current_dir(&self.repo_root);
        let output = run_command(cmd, GH_TIMEOUT, GH_OUTPUT_LIMIT)
            .await
            .with_context(|| format!("{} {}", self.program, args.join(" ")))?;
        if output.success() {
            Ok(Ok(output.stdout_lossy()))
        } else {
            Ok(Err(output.detail()))
        }
    }

    fn failed(&self, args: &[&str], detail: String) -> anyhow::Error {
        ForemanError::TransientTool {
            command: format!("{} {}", self.program, args.join(" ")),
            detail,
        }
        .into()
    }
}

#[derive(Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
}

#[async_trait]
impl HostingPlatform for GhCli {
    #[instrument(skip_all, fields(item_id))]
    async fn fetch_item(&self, item_id: u64) -> Result<WorkItem> {
        let id = item_id.to_string();
        let args = ["issue", "view", id.as_str(), "--json", "number,title,body"];
        let stdout = self
            .run_gh(&args)
            .await?
            .map_err(|detail| self.failed(&args, detail))?;
        let issue: GhIssue =
            serde_json::from_str(&stdout).with_context(|| format!("parse issue {item_id}"))?;
        Ok(WorkItem {
            id: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
        })
    }

    #[instrument(skip_all)]
    async fn list_artifacts(&self) -> Result<Vec<RemoteArtifact>> {
        let args = [
            "pr",
            "list",
            "--state",
            "all",
            "--limit",
            LIST_LIMIT,
            "--json",
            "number,url,title,body,headRefName,state",
        ];
        let stdout = self
            .run_gh(&args)
            .await?
            .map_err(|detail| self.failed(&args, detail))?;
        parse_artifact_list(&stdout)
    }

    #[instrument(skip_all, fields(item_id = request.item_id, head = %request.head))]
    async fn create_artifact(&self, request: &ArtifactRequest) -> Result<CreateOutcome> {
        let args = [
            "pr",
            "create",
            "--title",
            request.title.as_str(),
            "--body",
            request.body.as_str(),
            "--head",
            request.head.as_str(),
        ];
        match self.run_gh(&args).await? {
            Ok(stdout) => {
                let link = find_artifact_url(&stdout)
                    .ok_or_else(|| anyhow!("gh pr create printed no url: {}", stdout.trim()))?;
                info!(number = link.number, url = %link.url, "created artifact");
                Ok(CreateOutcome::Created {
                    number: link.number,
                    url: link.url,
                })
            }
            Err(detail) if is_already_exists(&detail) => {
                debug!(detail = %detail, "artifact already exists");
                Ok(CreateOutcome::AlreadyExists { detail })
            }
            Err(detail) => Err(self.failed(&args[..2], detail)),
        }
    }
}

fn parse_artifact_list(stdout: &str) -> Result<Vec<RemoteArtifact>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut artifacts: Vec<RemoteArtifact> =
        serde_json::from_str(stdout).context("parse artifact list")?;
    for artifact in &mut artifacts {
        if artifact.state.is_empty() {
            artifact.state = "OPEN".to_string();
        }
    }
    Ok(artifacts)
}

fn is_already_exists(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    lower.contains("already exists")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pr_list_json() {
        let json = r#"[
            {"number":12,"url":"https://github.com/a/b/pull/12","title":"Fix login",
             "body":"Closes #42","headRefName":"item-42","state":"MERGED"},
            {"number":13,"url":"https://github.com/a/b/pull/13","title":"x",
             "headRefName":"other"}
        ]"#;
        let list = parse_artifact_list(json).expect("parse");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].head_branch, "item-42");
        assert_eq!(list[0].state, "MERGED");
        assert_eq!(list[1].state, "OPEN");
    }

    #[test]
    fn empty_output_is_empty_list() {
        assert!(parse_artifact_list("  \n").expect("parse").is_empty());
    }

    #[test]
    fn detects_duplicate_errors() {
        assert!(is_already_exists(
            "a pull request for branch \"item-42\" into branch \"main\" already exists:\nhttps://github.com/a/b/pull/9"
        ));
        assert!(!is_already_exists("HTTP 502: bad gateway"));
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gh = GhCli::new(temp.path()).with_program("definitely-not-a-gh-binary");
        let err = gh.list_artifacts().await.expect_err("missing binary");
        assert!(format!("{err:#}").contains("spawn command"));
    }
}
