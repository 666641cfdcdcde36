use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{JobExecutionError, OrchestratorError, Result};
use crate::orchestrator::engine::{Dispatch, Orchestrator, Progress};
use crate::worker::executor::JobExecutor;
use crate::worker::handler::JobContext;
use crate::worker::heartbeat::HeartbeatSender;

/// Body of `POST /workers/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub max_concurrency: u32,
}

impl From<&WorkerConfig> for WorkerRegistration {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            hostname: config.hostname.clone(),
            capabilities: config.capabilities.clone(),
            max_concurrency: config.max_concurrency,
        }
    }
}

/// How a worker talks to the orchestrators: in process, or over HTTP.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register(&self, registration: &WorkerRegistration) -> Result<()>;
    /// Returns dispatch tokens the worker should abort.
    async fn heartbeat(&self, worker_id: &str, current_load: u32) -> Result<Vec<Uuid>>;
    async fn deregister(&self, worker_id: &str) -> Result<()>;
    async fn poll(&self, worker_id: &str) -> Result<Option<Dispatch>>;
    async fn started(&self, token: Uuid) -> Result<()>;
    async fn progress(&self, token: Uuid, progress: Progress) -> Result<()>;
    async fn completed(&self, token: Uuid, output: Value) -> Result<()>;
    async fn failed(&self, token: Uuid, error: &JobExecutionError) -> Result<()>;
}

/// Control plane for a worker embedded in a server node.
pub struct LocalControlPlane {
    orchestrator: Arc<Orchestrator>,
}

impl LocalControlPlane {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn register(&self, registration: &WorkerRegistration) -> Result<()> {
        self.orchestrator
            .register_worker(
                &registration.worker_id,
                &registration.hostname,
                registration.capabilities.clone(),
                registration.max_concurrency,
            )
            .await
            .map(|_| ())
    }

    async fn heartbeat(&self, worker_id: &str, current_load: u32) -> Result<Vec<Uuid>> {
        self.orchestrator.heartbeat(worker_id, current_load).await
    }

    async fn deregister(&self, worker_id: &str) -> Result<()> {
        self.orchestrator.deregister_worker(worker_id).await.map(|_| ())
    }

    async fn poll(&self, worker_id: &str) -> Result<Option<Dispatch>> {
        self.orchestrator.poll(worker_id).await
    }

    async fn started(&self, token: Uuid) -> Result<()> {
        self.orchestrator.report_started(token).await
    }

    async fn progress(&self, token: Uuid, progress: Progress) -> Result<()> {
        self.orchestrator.report_progress(token, progress).await
    }

    async fn completed(&self, token: Uuid, output: Value) -> Result<()> {
        self.orchestrator.report_completed(token, output).await
    }

    async fn failed(&self, token: Uuid, error: &JobExecutionError) -> Result<()> {
        self.orchestrator
            .report_failed(token, &error.message, error.retryable)
            .await
    }
}

/// Cancellation handles of the dispatches currently running, by token.
pub(crate) type RunningJobs = Arc<RwLock<HashMap<Uuid, CancellationToken>>>;

/// A worker process: registers, heartbeats on its own timer, pulls work
/// while below `max_concurrency` and reports results.
pub struct WorkerRuntime {
    config: WorkerConfig,
    control: Arc<dyn ControlPlane>,
    executor: JobExecutor,
    running: RunningJobs,
    load: Arc<AtomicU32>,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig, control: Arc<dyn ControlPlane>, executor: JobExecutor) -> Self {
        Self {
            config,
            control,
            executor,
            running: Arc::new(RwLock::new(HashMap::new())),
            load: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn current_load(&self) -> u32 {
        self.load.load(Ordering::SeqCst)
    }

    /// Run until `shutdown` fires, then stop polling, let running jobs
    /// finish and deregister.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let registration = WorkerRegistration::from(&self.config);
        self.control.register(&registration).await?;

        let heartbeat = HeartbeatSender::new(self.config.heartbeat_interval_ms);
        let heartbeat_stop = CancellationToken::new();
        let heartbeat_task = {
            let control = self.control.clone();
            let running = self.running.clone();
            let load = self.load.clone();
            let stop = heartbeat_stop.clone();
            tokio::spawn(async move {
                heartbeat
                    .run(control, registration, running, load, stop)
                    .await;
            })
        };

        let mut jobs = JoinSet::new();
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        let max_backoff = Duration::from_millis(self.config.max_poll_backoff_ms);
        let mut backoff = idle;

        loop {
            // Reap finished jobs so the set does not grow unbounded
            while let Some(joined) = jobs.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(worker_id = %self.config.worker_id, error = %e, "Job task failed");
                }
            }

            let delay = if self.current_load() >= self.config.max_concurrency {
                Some(idle)
            } else {
                match self.control.poll(&self.config.worker_id).await {
                    Ok(Some(dispatch)) => {
                        backoff = idle;
                        self.spawn_job(&mut jobs, dispatch).await;
                        None
                    }
                    Ok(None) => {
                        let wait = backoff;
                        backoff = (backoff * 2).min(max_backoff);
                        Some(wait)
                    }
                    Err(OrchestratorError::WorkerNotFound(_)) => {
                        tracing::warn!(worker_id = %self.config.worker_id, "Worker unknown to orchestrator, re-registering");
                        if let Err(e) = self
                            .control
                            .register(&WorkerRegistration::from(&self.config))
                            .await
                        {
                            tracing::warn!(error = %e, "Re-registration failed");
                        }
                        Some(backoff)
                    }
                    Err(e) => {
                        tracing::warn!(worker_id = %self.config.worker_id, error = %e, "Poll failed");
                        let wait = backoff;
                        backoff = (backoff * 2).min(max_backoff);
                        Some(wait)
                    }
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            } else if shutdown.is_cancelled() {
                break;
            }
        }

        tracing::info!(
            worker_id = %self.config.worker_id,
            running = jobs.len(),
            "Worker draining running jobs"
        );
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                tracing::error!(worker_id = %self.config.worker_id, error = %e, "Job task failed");
            }
        }

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat_task.await {
            tracing::error!(worker_id = %self.config.worker_id, error = %e, "Heartbeat task failed");
        }
        if let Err(e) = self.control.deregister(&self.config.worker_id).await {
            tracing::warn!(worker_id = %self.config.worker_id, error = %e, "Failed to deregister");
        }
        tracing::info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    async fn spawn_job(&self, jobs: &mut JoinSet<()>, dispatch: Dispatch) {
        let cancel = CancellationToken::new();
        self.running.write().await.insert(dispatch.token, cancel.clone());
        self.load.fetch_add(1, Ordering::SeqCst);

        let control = self.control.clone();
        let executor = self.executor.clone();
        let running = self.running.clone();
        let load = self.load.clone();
        jobs.spawn(async move {
            let task = tokio::spawn(run_dispatch(
                control.clone(),
                executor,
                dispatch.clone(),
                cancel,
            ));
            if let Err(e) = task.await {
                tracing::error!(
                    execution_id = %dispatch.execution_id,
                    node_id = %dispatch.node_id,
                    error = %e,
                    "Job task failed"
                );
                let error = JobExecutionError::new(format!("handler failed: {e}"));
                if let Err(e) = control.failed(dispatch.token, &error).await {
                    tracing::warn!(execution_id = %dispatch.execution_id, node_id = %dispatch.node_id, error = %e, "Failed to report job result");
                }
            }
            running.write().await.remove(&dispatch.token);
            load.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// Execute one dispatch and report its outcome.
pub async fn run_dispatch(
    control: Arc<dyn ControlPlane>,
    executor: JobExecutor,
    dispatch: Dispatch,
    cancel: CancellationToken,
) {
    let token = dispatch.token;
    if let Err(e) = control.started(token).await {
        // Stale dispatch (failed over or cancelled meanwhile); do not run it
        tracing::warn!(execution_id = %dispatch.execution_id, node_id = %dispatch.node_id, error = %e, "Dispatch rejected on start");
        return;
    }

    let ctx = JobContext {
        attempt: dispatch.attempt,
        resource_limits: dispatch.resource_limits.clone(),
        checkpoint_ref: dispatch.checkpoint_ref.clone(),
        cancel,
        ..JobContext::new(dispatch.execution_id, dispatch.node_id.clone())
    }
    .with_reporter(control.clone(), token);

    let report = match executor.execute(&dispatch, ctx).await {
        Ok(output) => {
            tracing::info!(execution_id = %dispatch.execution_id, node_id = %dispatch.node_id, "Job succeeded");
            control.completed(token, output).await
        }
        Err(error) => {
            tracing::warn!(
                execution_id = %dispatch.execution_id,
                node_id = %dispatch.node_id,
                error = %error,
                retryable = error.retryable,
                "Job failed"
            );
            control.failed(token, &error).await
        }
    };

    if let Err(e) = report {
        tracing::warn!(execution_id = %dispatch.execution_id, node_id = %dispatch.node_id, error = %e, "Failed to report job result");
    }
}
