//! Reconciliation of completed agents against the hosting platform.
//!
//! The platform is an in-memory fake that counts creations, so every test
//! can assert that no item ever gets a second artifact.

use std::sync::Arc;
use std::time::Duration;

use foreman::core::types::{LogEntry, LogKind};
use foreman::error::ForemanError;
use foreman::orchestrator::Orchestrator;
use foreman::reconcile::{CompletedAgent, ReconciliationManager};
use foreman::test_support::{
    FakeHosting, ScriptedWorker, TestRepo, WorkerScript, fast_config, remote_artifact, success,
    text,
};

const PUSH_OUTPUT: &str = "To github.com:acme/app.git\n * [new branch]      item-42 -> item-42";

fn reconciler(hosting: &Arc<FakeHosting>) -> ReconciliationManager {
    ReconciliationManager::new(hosting.clone(), fast_config().reconcile)
}

fn completed(item_id: u64, logs: &[&str]) -> CompletedAgent {
    CompletedAgent {
        item_id,
        title: format!("Item {item_id}"),
        branch: format!("item-{item_id}"),
        logs: logs
            .iter()
            .map(|line| LogEntry::new(LogKind::ToolResult, *line))
            .collect(),
    }
}

#[tokio::test]
async fn pushed_branch_gets_exactly_one_artifact() {
    let hosting = Arc::new(FakeHosting::new());
    let manager = reconciler(&hosting);
    assert!(manager.enqueue(completed(42, &[PUSH_OUTPUT])));

    let report = manager.run_pass().await;
    assert_eq!(report.created, vec![42]);
    assert_eq!(hosting.create_count(), 1);
    let artifact = manager.artifact(42).expect("artifact");
    assert_eq!(artifact.number, Some(100));
    let created = &hosting.artifacts()[0];
    assert!(created.body.starts_with("Closes #42"));
    assert_eq!(created.head_branch, "item-42");

    // Rescanning the same completion is a no-op.
    assert!(!manager.enqueue(completed(42, &[PUSH_OUTPUT])));
    assert_eq!(manager.scan(vec![completed(42, &[PUSH_OUTPUT])]), 0);
    assert!(manager.run_pass().await.is_empty());
    assert_eq!(hosting.create_count(), 1);
}

#[tokio::test]
async fn existing_artifact_linking_the_item_is_backfilled() {
    let hosting = Arc::new(FakeHosting::new());
    hosting.add_artifact(remote_artifact(55, "Fix redirect", "Closes #42", "feature/redirect"));
    let manager = reconciler(&hosting);
    manager.enqueue(completed(42, &[]));

    let report = manager.run_pass().await;

    assert_eq!(report.matched, vec![42]);
    assert_eq!(manager.artifact(42).and_then(|a| a.number), Some(55));
    assert_eq!(hosting.create_count(), 0);
}

#[tokio::test]
async fn existing_artifact_on_item_branch_is_backfilled() {
    let hosting = Arc::new(FakeHosting::new());
    hosting.add_artifact(remote_artifact(61, "Unrelated title", "", "item-42"));
    let manager = reconciler(&hosting);
    manager.enqueue(completed(42, &[]));

    let report = manager.run_pass().await;

    assert_eq!(report.matched, vec![42]);
    assert_eq!(hosting.create_count(), 0);
}

#[tokio::test]
async fn conflict_on_create_requeries_instead_of_duplicating() {
    let hosting = Arc::new(FakeHosting::new());
    hosting.conflict_with(remote_artifact(77, "Item 42", "", "item-42"));
    let manager = reconciler(&hosting);
    manager.enqueue(completed(42, &[PUSH_OUTPUT]));

    let report = manager.run_pass().await;

    assert_eq!(report.matched, vec![42]);
    assert_eq!(manager.artifact(42).and_then(|a| a.number), Some(77));
    assert_eq!(hosting.create_count(), 0);
    assert!(hosting.list_count() >= 2);
}

#[tokio::test]
async fn no_push_evidence_exhausts_without_creating() {
    let hosting = Arc::new(FakeHosting::new());
    let manager = reconciler(&hosting);
    manager.enqueue(completed(42, &["edited src/lib.rs"]));

    let mut exhausted = Vec::new();
    for _ in 0..10 {
        let report = manager.run_pass().await;
        exhausted.extend(report.exhausted);
        if manager.is_drained() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(exhausted, vec![42]);
    assert_eq!(hosting.create_count(), 0);
    let failures = manager.failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        ForemanError::RecoveryExhausted {
            item_id: 42,
            attempts: 3,
            ..
        }
    ));
}

#[tokio::test]
async fn listing_failure_is_retried_later() {
    let hosting = Arc::new(FakeHosting::new());
    hosting.fail_listing(true);
    let manager = reconciler(&hosting);
    manager.enqueue(completed(42, &[PUSH_OUTPUT]));

    let report = manager.run_pass().await;
    assert_eq!(report.retried, vec![42]);
    assert_eq!(manager.queued()[0].attempts, 1);

    hosting.fail_listing(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = manager.run_pass().await;
    assert_eq!(report.created, vec![42]);
    assert_eq!(hosting.create_count(), 1);
}

#[tokio::test]
async fn overlapping_passes_do_not_double_create() {
    let hosting = Arc::new(FakeHosting::new());
    let manager = reconciler(&hosting);
    manager.enqueue(completed(42, &[PUSH_OUTPUT]));

    let (a, b) = tokio::join!(manager.run_pass(), manager.run_pass());

    assert_eq!(a.created.len() + b.created.len(), 1);
    assert_eq!(hosting.create_count(), 1);
}

#[tokio::test]
async fn foreign_url_in_worker_output_does_not_count_as_linked() {
    let repo = TestRepo::new().expect("repo");
    let hosting = Arc::new(FakeHosting::new());
    let worker = Arc::new(ScriptedWorker::new());
    worker.script(
        42,
        WorkerScript::messages(vec![
            text("Same bug as https://github.com/upstream/lib/pull/9"),
            text(PUSH_OUTPUT),
            success("pushed the fix"),
        ]),
    );
    let orchestrator =
        Orchestrator::new(repo.path(), fast_config(), hosting.clone(), worker, false)
            .expect("orchestrator");

    orchestrator.deploy(42, None).await.expect("deploy");
    orchestrator.run_until_settled().await;

    assert_eq!(hosting.create_count(), 1);
    let artifact = orchestrator.reconciler().artifact(42).expect("artifact");
    assert_eq!(artifact.number, Some(100));
    assert_eq!(orchestrator.reconciler().candidate(42), None);
}

#[tokio::test]
async fn completed_agent_without_link_is_reconciled_after_settling() {
    let repo = TestRepo::new().expect("repo");
    let hosting = Arc::new(FakeHosting::new());
    let worker = Arc::new(ScriptedWorker::new());
    worker.script(
        42,
        WorkerScript::messages(vec![text(PUSH_OUTPUT), success("pushed the fix")]),
    );
    let orchestrator =
        Orchestrator::new(repo.path(), fast_config(), hosting.clone(), worker, false)
            .expect("orchestrator");

    orchestrator.deploy(42, None).await.expect("deploy");
    let reports = orchestrator.run_until_settled().await;

    assert!(reports.iter().any(|r| r.created == vec![42]));
    assert_eq!(hosting.create_count(), 1);
    assert!(orchestrator.reconciler().has_concrete(42));
}
