//! End-to-end tests: a worker runtime driving executions through an
//! in-process orchestrator.


use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_lite::config::SandboxConfig;
use conductor_lite::error::JobExecutionError;
use conductor_lite::orchestrator::{ExecutionStatus, Orchestrator, Progress};
use conductor_lite::scheduler::{JobNode, NodeStatus};
use conductor_lite::worker::{
    HandlerRegistry, JobContext, JobExecutor, JobHandler, LocalControlPlane, WorkerRuntime,
};
use serde_json::{json, Value};
use test_harness::{node_status, test_orchestrator, test_worker_config, wait_for, wait_for_status};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Succeeds once a checkpoint from an earlier attempt is available
struct ResumableHandler;

#[async_trait]
impl JobHandler for ResumableHandler {
    async fn execute(&self, _config: &Value, ctx: &JobContext) -> Result<Value, JobExecutionError> {
        match &ctx.checkpoint_ref {
            Some(checkpoint) => Ok(json!({"resumed_from": checkpoint, "attempt": ctx.attempt})),
            None => {
                ctx.report_progress(Progress {
                    output: None,
                    checkpoint_ref: Some("ckpt/half".to_string()),
                })
                .await;
                Err(JobExecutionError::new("preempted"))
            }
        }
    }
}

/// Panics on its first call, succeeds afterwards
#[derive(Default)]
struct PanicOnceHandler {
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for PanicOnceHandler {
    async fn execute(&self, _config: &Value, ctx: &JobContext) -> Result<Value, JobExecutionError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("handler bug");
        }
        Ok(json!({"attempt": ctx.attempt}))
    }
}

struct TestWorker {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestWorker {
    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap();
    }
}

fn start_worker(orch: &Arc<Orchestrator>, worker_id: &str, executor: JobExecutor) -> TestWorker {
    let control = Arc::new(LocalControlPlane::new(orch.clone()));
    let runtime = WorkerRuntime::new(test_worker_config(worker_id), control, executor);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        runtime.run(token).await.unwrap();
    });
    TestWorker { shutdown, handle }
}

#[tokio::test]
async fn test_worker_runs_dag_to_completion() {
    let orch = test_orchestrator();
    let worker = start_worker(&orch, "w1", JobExecutor::with_sandbox(SandboxConfig::default()));

    let id = orch
        .submit(
            "etl",
            vec![
                JobNode::new("extract", "shell").with_config(json!({"command": "echo rows"})),
                JobNode::new("clean", "echo")
                    .depends_on("extract")
                    .with_config(json!({"table": "clean"})),
                JobNode::new("index", "echo")
                    .depends_on("extract")
                    .with_config(json!({"table": "index"})),
                JobNode::new("publish", "echo")
                    .depends_on("clean")
                    .depends_on("index"),
            ],
        )
        .await
        .unwrap();

    let execution = wait_for_status(&orch, id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await
        .expect("execution should complete");

    assert_eq!(execution.count(NodeStatus::Completed), 4);
    let extract = execution.node("extract").unwrap();
    assert_eq!(extract.output.as_ref().unwrap()["stdout"], "rows\n");
    assert_eq!(extract.assigned_worker_id.as_deref(), Some("w1"));
    assert_eq!(
        execution.node("clean").unwrap().output,
        Some(json!({"table": "clean"}))
    );

    worker.stop().await;
    // Deregistered on shutdown
    assert!(orch.active_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_retries_failed_job_and_execution_fails() {
    let orch = test_orchestrator();
    let worker = start_worker(&orch, "w1", JobExecutor::with_sandbox(SandboxConfig::default()));

    let id = orch
        .submit(
            "broken",
            vec![JobNode::new("bad", "shell")
                .with_config(json!({"command": "echo nope >&2; exit 2"}))
                .with_retry(2, 10)],
        )
        .await
        .unwrap();

    let execution = wait_for_status(&orch, id, ExecutionStatus::Failed, Duration::from_secs(5))
        .await
        .expect("execution should fail");
    let node = execution.node("bad").unwrap();
    assert_eq!(node.attempt, 2);
    assert_eq!(node.error.as_deref(), Some("nope"));
    assert_eq!(orch.dead_letters().await.len(), 1);

    worker.stop().await;
}

#[tokio::test]
async fn test_checkpoint_carried_into_retry() {
    let orch = test_orchestrator();
    let mut registry = HandlerRegistry::new();
    registry.register("resumable", ResumableHandler);
    let worker = start_worker(&orch, "w1", JobExecutor::new(registry));

    let id = orch
        .submit(
            "train",
            vec![JobNode::new("fit", "resumable").with_retry(3, 10)],
        )
        .await
        .unwrap();

    let execution = wait_for_status(&orch, id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await
        .expect("execution should complete on retry");
    assert_eq!(
        execution.node("fit").unwrap().output,
        Some(json!({"resumed_from": "ckpt/half", "attempt": 1}))
    );

    worker.stop().await;
}

#[tokio::test]
async fn test_cancel_reaches_running_job_through_heartbeat() {
    let orch = test_orchestrator();
    let worker = start_worker(&orch, "w1", JobExecutor::with_sandbox(SandboxConfig::default()));

    let id = orch
        .submit(
            "long",
            vec![JobNode::new("sleepy", "echo").with_config(json!({"sleep_ms": 30_000}))],
        )
        .await
        .unwrap();

    let orch_ref = &orch;
    let running = wait_for(Duration::from_secs(2), move || async move {
        node_status(orch_ref, id, "sleepy").await == NodeStatus::Running
    })
    .await;
    assert!(running, "job should start");

    orch.cancel(id).await.unwrap();

    let aborted = wait_for(Duration::from_secs(2), move || async move {
        node_status(orch_ref, id, "sleepy").await == NodeStatus::Failed
    })
    .await;
    assert!(aborted, "job should be aborted by the worker");

    let execution = orch.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(
        execution.node("sleepy").unwrap().error.as_deref(),
        Some("cancelled")
    );

    // The worker is free again and shuts down promptly
    tokio::time::timeout(Duration::from_secs(2), worker.stop())
        .await
        .expect("worker should stop");
}

#[tokio::test]
async fn test_capabilities_route_work_between_workers() {
    let orch = test_orchestrator();
    let executor = JobExecutor::with_sandbox(SandboxConfig::default());

    let control = Arc::new(LocalControlPlane::new(orch.clone()));
    let gpu_config = test_worker_config("gpu-1").with_capability("gpu");
    let gpu_runtime = WorkerRuntime::new(gpu_config, control, executor.clone());
    let gpu_shutdown = CancellationToken::new();
    let token = gpu_shutdown.clone();
    let gpu_handle = tokio::spawn(async move {
        gpu_runtime.run(token).await.unwrap();
    });
    let cpu = start_worker(&orch, "cpu-1", executor);

    let id = orch
        .submit(
            "mixed",
            vec![
                JobNode::new("train", "echo").with_capability("gpu"),
                JobNode::new("report", "echo"),
            ],
        )
        .await
        .unwrap();

    let execution = wait_for_status(&orch, id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await
        .expect("execution should complete");
    assert_eq!(
        execution.node("train").unwrap().assigned_worker_id.as_deref(),
        Some("gpu-1")
    );

    cpu.stop().await;
    gpu_shutdown.cancel();
    gpu_handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_running_jobs() {
    let orch = test_orchestrator();
    let worker = start_worker(&orch, "w1", JobExecutor::with_sandbox(SandboxConfig::default()));

    let id = orch
        .submit(
            "short",
            vec![JobNode::new("nap", "echo").with_config(json!({"sleep_ms": 300}))],
        )
        .await
        .unwrap();

    let orch_ref = &orch;
    let running = wait_for(Duration::from_secs(2), move || async move {
        node_status(orch_ref, id, "nap").await == NodeStatus::Running
    })
    .await;
    assert!(running, "job should start");

    // Stop waits for the in-flight job instead of abandoning it
    worker.stop().await;
    assert_eq!(node_status(&orch, id, "nap").await, NodeStatus::Completed);
    assert_eq!(
        orch.get_execution(id).await.unwrap().status,
        ExecutionStatus::Completed
    );
}

#[tokio::test]
async fn test_handler_panic_counts_as_failed_attempt() {
    let orch = test_orchestrator();
    let mut registry = HandlerRegistry::new();
    registry.register("fragile", PanicOnceHandler::default());
    let worker = start_worker(&orch, "w1", JobExecutor::new(registry));

    let id = orch
        .submit("wf", vec![JobNode::new("n", "fragile").with_retry(2, 10)])
        .await
        .unwrap();

    let execution = wait_for_status(&orch, id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await
        .expect("retry after the panic should complete");
    assert_eq!(execution.node("n").unwrap().output, Some(json!({"attempt": 1})));
    assert_eq!(orch.assigned_load("w1").await.unwrap(), 0);

    // The worker survived the panic and shuts down cleanly
    worker.stop().await;
}
