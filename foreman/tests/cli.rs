//! CLI tests that spawn the foreman binary.

use std::process::Command;

use foreman::exit_codes;
use foreman::io::config::{config_path, load_config};
use foreman::test_support::TestRepo;

#[test]
fn init_writes_default_config_once() {
    let repo = TestRepo::new().expect("repo");

    let status = Command::new(env!("CARGO_BIN_EXE_foreman"))
        .current_dir(repo.path())
        .arg("init")
        .status()
        .expect("foreman init");
    assert_eq!(status.code(), Some(exit_codes::OK));

    let path = config_path(repo.path());
    let config = load_config(&path).expect("load config");
    assert_eq!(config.workspace.workspaces_dir, "workspaces");

    std::fs::write(&path, "[workspace]\nworkspaces_dir = \"trees\"\n").expect("edit config");
    let status = Command::new(env!("CARGO_BIN_EXE_foreman"))
        .current_dir(repo.path())
        .arg("init")
        .status()
        .expect("foreman init again");
    assert_eq!(status.code(), Some(exit_codes::OK));
    let config = load_config(&path).expect("reload config");
    assert_eq!(config.workspace.workspaces_dir, "trees");
}

#[test]
fn status_without_agents_prints_empty_list() {
    let repo = TestRepo::new().expect("repo");

    let output = Command::new(env!("CARGO_BIN_EXE_foreman"))
        .arg("--root")
        .arg(repo.path())
        .arg("status")
        .output()
        .expect("foreman status");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "[]");
}

#[test]
fn sweep_removes_orphaned_branches() {
    let repo = TestRepo::new().expect("repo");
    repo.git(&["branch", "item-99"]).expect("branch");

    let output = Command::new(env!("CARGO_BIN_EXE_foreman"))
        .current_dir(repo.path())
        .arg("sweep")
        .output()
        .expect("foreman sweep");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("destroyed: [99]"));
    assert!(
        !repo
            .branches()
            .expect("branches")
            .contains(&"item-99".to_string())
    );
}

#[test]
fn invalid_config_exits_invalid() {
    let repo = TestRepo::new().expect("repo");
    let path = config_path(repo.path());
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, "[workspace]\nworkspaces_dir = \"/abs\"\n").expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_foreman"))
        .current_dir(repo.path())
        .arg("status")
        .output()
        .expect("foreman status");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("workspaces_dir"));
}
