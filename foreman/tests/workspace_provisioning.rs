//! Workspace provisioning against real git repositories.
//!
//! Covers path validation, leftover replacement, idempotent destroy, and the
//! startup orphan sweep.

use std::fs;

use foreman::error::ForemanError;
use foreman::repo_mutex::RepoMutex;
use foreman::test_support::{TestRepo, fast_config};
use foreman::workspace::WorkspaceProvisioner;

fn provisioner(repo: &TestRepo) -> WorkspaceProvisioner {
    WorkspaceProvisioner::new(repo.path(), fast_config().workspace, RepoMutex::new())
        .expect("provisioner")
}

#[tokio::test]
async fn provision_creates_worktree_on_item_branch() {
    let repo = TestRepo::new().expect("repo");
    fs::write(repo.path().join(".env"), "TOKEN=local\n").expect("write .env");
    let provisioner = provisioner(&repo);

    let workspace = provisioner.provision(42).await.expect("provision");

    assert_eq!(workspace.branch, "item-42");
    assert_eq!(
        workspace.path,
        provisioner.root().join("workspaces").join("item-42")
    );
    assert!(workspace.path.join("README.md").is_file());
    assert_eq!(
        fs::read_to_string(workspace.path.join(".env")).expect("copied .env"),
        "TOKEN=local\n"
    );
    assert!(
        repo.branches()
            .expect("branches")
            .contains(&"item-42".to_string())
    );
    assert_eq!(repo.worktrees().expect("worktrees"), vec![workspace.path]);
}

#[tokio::test]
async fn provision_replaces_leftover_worktree() {
    let repo = TestRepo::new().expect("repo");
    let provisioner = provisioner(&repo);

    let first = provisioner.provision(7).await.expect("first provision");
    fs::write(first.path.join("scratch.txt"), "leftover").expect("write scratch");

    let second = provisioner.provision(7).await.expect("second provision");

    assert_eq!(first.path, second.path);
    assert!(!second.path.join("scratch.txt").exists());
    assert_eq!(repo.worktrees().expect("worktrees").len(), 1);
}

#[tokio::test]
async fn provision_clears_unregistered_directory() {
    let repo = TestRepo::new().expect("repo");
    let provisioner = provisioner(&repo);
    let path = provisioner.workspace_path(9).expect("path");
    fs::create_dir_all(&path).expect("create stray dir");
    fs::write(path.join("junk"), "x").expect("write junk");

    let workspace = provisioner.provision(9).await.expect("provision");

    assert!(!workspace.path.join("junk").exists());
    assert!(workspace.path.join("README.md").is_file());
}

#[tokio::test]
async fn workspaces_dir_escaping_root_is_rejected_before_any_change() {
    let repo = TestRepo::new().expect("repo");
    let mut config = fast_config().workspace;
    config.workspaces_dir = "../escaped-workspaces".to_string();
    let provisioner =
        WorkspaceProvisioner::new(repo.path(), config, RepoMutex::new()).expect("provisioner");

    let err = provisioner.workspace_path(1).expect_err("outside root");
    assert!(ForemanError::is_validation(&err), "got {err:#}");

    let err = provisioner.provision(1).await.expect_err("provision refused");
    assert!(ForemanError::is_validation(&err), "got {err:#}");
    let outside = provisioner
        .root()
        .parent()
        .expect("parent")
        .join("escaped-workspaces")
        .join("item-1");
    assert!(!outside.exists());
    assert!(repo.worktrees().expect("worktrees").is_empty());
    assert!(
        !repo
            .branches()
            .expect("branches")
            .contains(&"item-1".to_string())
    );
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_workspaces_dir_outside_root_is_rejected() {
    let repo = TestRepo::new().expect("repo");
    let elsewhere = tempfile::tempdir().expect("tempdir");
    std::os::unix::fs::symlink(elsewhere.path(), repo.path().join("workspaces"))
        .expect("symlink");
    let provisioner = provisioner(&repo);

    let err = provisioner.provision(3).await.expect_err("escape refused");

    assert!(ForemanError::is_validation(&err), "got {err:#}");
    assert!(!elsewhere.path().join("item-3").exists());
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let repo = TestRepo::new().expect("repo");
    let provisioner = provisioner(&repo);
    let workspace = provisioner.provision(5).await.expect("provision");

    let first = provisioner.destroy(5).await;
    assert!(first.is_clean(), "errors: {:?}", first.errors);
    assert!(first.worktree_removed);
    assert!(first.branch_deleted);
    assert!(!workspace.path.exists());

    let second = provisioner.destroy(5).await;
    assert!(second.is_clean(), "errors: {:?}", second.errors);
    assert!(second.already_absent);
    assert!(!second.branch_deleted);
    assert!(repo.worktrees().expect("worktrees").is_empty());
}

#[tokio::test]
async fn destroy_never_touches_other_items() {
    let repo = TestRepo::new().expect("repo");
    let provisioner = provisioner(&repo);
    let keep = provisioner.provision(1).await.expect("provision 1");
    provisioner.provision(2).await.expect("provision 2");

    provisioner.destroy(2).await;

    assert!(keep.path.join("README.md").is_file());
    assert_eq!(repo.worktrees().expect("worktrees"), vec![keep.path]);
}

#[tokio::test]
async fn concurrent_provisions_share_the_repo_safely() {
    let repo = TestRepo::new().expect("repo");
    let provisioner = provisioner(&repo);

    let (a, b, c) = tokio::join!(
        provisioner.provision(11),
        provisioner.provision(12),
        provisioner.provision(13)
    );
    for workspace in [a, b, c] {
        let workspace = workspace.expect("provision");
        assert!(workspace.path.join("README.md").is_file());
    }
    assert_eq!(repo.worktrees().expect("worktrees").len(), 3);
}

#[tokio::test]
async fn sweep_destroys_only_untracked_items_once() {
    let repo = TestRepo::new().expect("repo");
    let provisioner = provisioner(&repo);
    provisioner.provision(42).await.expect("provision tracked");
    provisioner.provision(99).await.expect("provision orphan");
    // A bare branch with no workspace is an orphan too.
    repo.git(&["branch", "item-120"]).expect("branch");

    let report = provisioner.sweep_orphans(|id| id == 42).await;

    assert_eq!(report.kept, vec![42]);
    assert_eq!(report.destroyed_ids(), vec![99, 120]);
    assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
    let branches = repo.branches().expect("branches");
    assert!(branches.contains(&"item-42".to_string()));
    assert!(!branches.contains(&"item-99".to_string()));
    assert!(!branches.contains(&"item-120".to_string()));
    assert!(!provisioner.workspace_path(99).expect("path").exists());
}

#[tokio::test]
async fn inspect_reports_branch_and_pending_changes() {
    let repo = TestRepo::new().expect("repo");
    let provisioner = provisioner(&repo);
    assert_eq!(provisioner.inspect(8).await.expect("inspect missing"), None);

    let workspace = provisioner.provision(8).await.expect("provision");
    fs::write(workspace.path.join("notes.txt"), "draft").expect("write notes");

    let summary = provisioner
        .inspect(8)
        .await
        .expect("inspect")
        .expect("workspace present");

    assert_eq!(summary.branch.as_deref(), Some("item-8"));
    assert_eq!(summary.changes.len(), 1);
    assert_eq!(summary.changes[0].code, "??");
    assert_eq!(summary.changes[0].path, "notes.txt");
}
