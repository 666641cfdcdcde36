//! Failover tests for workers that stop heartbeating.
//!
//! These tests verify that nodes held by dead or deregistered workers are
//! returned to the queue, that the loss counts as a failed attempt, and
//! that healthy workers are left alone.


use std::time::Duration;

use conductor_lite::error::OrchestratorError;
use conductor_lite::orchestrator::ExecutionStatus;
use conductor_lite::scheduler::{JobNode, NodeStatus};
use serde_json::json;
use test_harness::{
    echo, expect_dispatch, node_status, register_worker, test_orchestrator, wait_for,
};
use tokio_util::sync::CancellationToken;

/// Test 1: A silent worker's node is requeued by the failover scan
#[tokio::test]
async fn test_dead_worker_node_requeued() {
    let orch = test_orchestrator();
    register_worker(&orch, "doomed", &[]).await;
    let id = orch
        .submit("wf", vec![JobNode::new("n", "shell").with_retry(3, 10)])
        .await
        .unwrap();

    let lost = expect_dispatch(&orch, "doomed").await;
    orch.report_started(lost.token).await.unwrap();

    // Within the heartbeat timeout nothing happens
    let summary = orch.failover_scan().await.unwrap();
    assert_eq!(summary.updated, 0);

    tokio::time::sleep(Duration::from_millis(350)).await;
    let summary = orch.failover_scan().await.unwrap();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.updated, 1);

    let execution = orch.get_execution(id).await.unwrap();
    let node = execution.node("n").unwrap();
    assert_eq!(node.status, NodeStatus::Queued);
    assert_eq!(node.attempt, 1);
    assert_eq!(
        node.error.as_deref(),
        Some("Worker doomed stopped heartbeating")
    );
    assert!(node.assigned_worker_id.is_none());

    // A healthy worker picks the node up as the next attempt
    register_worker(&orch, "rescuer", &[]).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let retry = expect_dispatch(&orch, "rescuer").await;
    assert_eq!(retry.node_id, "n");
    assert_eq!(retry.attempt, 1);

    // The dead worker's late report is refused
    assert!(matches!(
        orch.report_completed(lost.token, json!({})).await,
        Err(OrchestratorError::InvalidDispatchToken(_))
    ));
}

/// Test 2: The background loop recovers work within timeout plus one scan
#[tokio::test]
async fn test_failover_loop_recovers_work() {
    let orch = test_orchestrator();
    register_worker(&orch, "doomed", &[]).await;
    let id = orch
        .submit("wf", vec![JobNode::new("n", "shell").with_retry(3, 10)])
        .await
        .unwrap();
    expect_dispatch(&orch, "doomed").await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(orch.clone().run_failover_loop(shutdown.clone()));

    let pool = orch.config().pool.clone();
    let bound = Duration::from_millis(pool.heartbeat_timeout_ms + pool.failover_scan_interval_ms)
        + Duration::from_millis(200);
    let orch_ref = &orch;
    let recovered = wait_for(bound, move || async move {
        node_status(orch_ref, id, "n").await == NodeStatus::Queued
    })
    .await;
    assert!(recovered, "node should be requeued after the worker dies");

    shutdown.cancel();
    handle.await.unwrap();
}

/// Test 3: Deregistering a worker releases its work on the next scan
#[tokio::test]
async fn test_deregistered_worker_node_requeued() {
    let orch = test_orchestrator();
    register_worker(&orch, "leaving", &[]).await;
    let id = orch
        .submit("wf", vec![JobNode::new("n", "shell").with_retry(2, 10)])
        .await
        .unwrap();
    expect_dispatch(&orch, "leaving").await;

    assert!(orch.deregister_worker("leaving").await.unwrap());
    assert!(matches!(
        orch.poll("leaving").await,
        Err(OrchestratorError::WorkerNotFound(_))
    ));

    orch.failover_scan().await.unwrap();
    assert_eq!(node_status(&orch, id, "n").await, NodeStatus::Queued);
}

/// Test 4: Workers that keep heartbeating keep their work
#[tokio::test]
async fn test_live_worker_keeps_its_nodes() {
    let orch = test_orchestrator();
    register_worker(&orch, "steady", &[]).await;
    let id = orch.submit("wf", vec![echo("n")]).await.unwrap();
    let dispatch = expect_dispatch(&orch, "steady").await;
    orch.report_started(dispatch.token).await.unwrap();

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        orch.heartbeat("steady", 1).await.unwrap();
        let summary = orch.failover_scan().await.unwrap();
        assert_eq!(summary.updated, 0);
    }

    assert_eq!(node_status(&orch, id, "n").await, NodeStatus::Running);
    orch.report_completed(dispatch.token, json!({})).await.unwrap();
}

/// Test 5: Losing a worker on the last attempt fails the node
#[tokio::test]
async fn test_worker_loss_on_last_attempt_fails_execution() {
    let orch = test_orchestrator();
    register_worker(&orch, "doomed", &[]).await;
    let id = orch.submit("wf", vec![echo("n")]).await.unwrap();
    expect_dispatch(&orch, "doomed").await;

    tokio::time::sleep(Duration::from_millis(350)).await;
    orch.failover_scan().await.unwrap();

    let execution = orch.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let failure = execution.failure.expect("failure summary");
    assert_eq!(failure.node_id, "n");
    assert!(failure.error.contains("doomed"));
}

/// Test 6: Failover only touches the dead worker's nodes
#[tokio::test]
async fn test_failover_is_per_worker() {
    let orch = test_orchestrator();
    register_worker(&orch, "doomed", &[]).await;
    register_worker(&orch, "steady", &[]).await;
    let id = orch
        .submit(
            "wf",
            vec![
                JobNode::new("a", "shell").with_retry(3, 10),
                JobNode::new("b", "shell").with_retry(3, 10),
            ],
        )
        .await
        .unwrap();
    let on_doomed = expect_dispatch(&orch, "doomed").await;
    let on_steady = expect_dispatch(&orch, "steady").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    orch.heartbeat("steady", 1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    orch.failover_scan().await.unwrap();

    assert_eq!(
        node_status(&orch, id, &on_doomed.node_id).await,
        NodeStatus::Queued
    );
    assert_eq!(
        node_status(&orch, id, &on_steady.node_id).await,
        NodeStatus::Dispatched
    );
    orch.report_completed(on_steady.token, json!({}))
        .await
        .unwrap();
}
