use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::dag;
use crate::orchestrator::execution::{Execution, ExecutionStatus};
use crate::scheduler::job::{JobNode, ResourceLimits};
use crate::scheduler::pool::{WorkerPool, WorkerRecord};
use crate::scheduler::queue::{DeadLetter, JobQueue, QueueStats};
use crate::store::state::execution_resource;
use crate::store::{DispatchRef, SharedStore, StateStore};

/// Work handed to a worker by [`Orchestrator::poll`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    /// Authenticates every callback for this attempt
    pub token: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub handler_name: String,
    pub config: Value,
    pub attempt: u32,
    pub resource_limits: ResourceLimits,
    /// Last checkpoint recorded for the node, if any
    pub checkpoint_ref: Option<String>,
}

/// Progress report from a running dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub checkpoint_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub detail: String,
}

/// Aggregate liveness of queue, store and worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub instance_id: String,
    pub queue: ComponentHealth,
    pub store: ComponentHealth,
    pub workers: ComponentHealth,
    pub active_workers: usize,
}

/// Outcome of one reconciliation or failover pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub examined: usize,
    pub updated: usize,
}

/// The coordination engine of one orchestrator instance.
///
/// Executions are never owned in memory: every operation takes the
/// execution's distributed lock, reads the versioned state, applies the
/// change and writes it back with the version it read. Several instances
/// can share the same store and queue; whichever gets the lock drives the
/// execution for that tick.
pub struct Orchestrator {
    config: OrchestratorConfig,
    state: StateStore,
    pool: WorkerPool,
    queue: Arc<RwLock<JobQueue>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn SharedStore>,
        queue: Arc<RwLock<JobQueue>>,
    ) -> Self {
        Self {
            state: StateStore::new(store.clone(), config.store.clone()),
            pool: WorkerPool::new(store, config.pool.clone()),
            config,
            queue,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn queue(&self) -> &Arc<RwLock<JobQueue>> {
        &self.queue
    }

    // =========================================================================
    // Submission API
    // =========================================================================

    /// Validate and persist a new execution, then run its first tick so the
    /// root nodes are queued.
    pub async fn submit(&self, workflow_id: &str, nodes: Vec<JobNode>) -> Result<Uuid> {
        dag::validate(&nodes)?;

        let execution = Execution::new(workflow_id, nodes, Utc::now());
        let execution_id = execution.execution_id;
        self.state.put_execution_state(&execution, None).await?;
        tracing::info!(
            execution_id = %execution_id,
            workflow_id,
            nodes = execution.nodes.len(),
            "Execution submitted"
        );

        // The reconciliation loop picks it up if this first tick loses a race
        if let Err(e) = self.tick(execution_id).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "Initial tick failed");
        }
        Ok(execution_id)
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<Execution> {
        self.state
            .get_execution_state(execution_id)
            .await?
            .map(|(execution, _)| execution)
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))
    }

    /// All stored executions, oldest first.
    pub async fn list_executions(&self) -> Result<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .state
            .list_executions()
            .await?
            .into_iter()
            .map(|(execution, _)| execution)
            .collect();
        executions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        Ok(executions)
    }

    /// Mark the execution cancelled. Running nodes learn about it through
    /// their worker's next heartbeat and are force-failed after the grace
    /// period.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<()> {
        let signalled = self
            .with_execution(execution_id, |execution, queue, now| {
                execution.cancel(queue, now)
            })
            .await?;
        tracing::info!(execution_id = %execution_id, running = signalled.len(), "Cancellation requested");
        Ok(())
    }

    pub async fn pause(&self, execution_id: Uuid) -> Result<()> {
        self.with_execution(execution_id, |execution, queue, now| {
            execution.pause(queue, now)
        })
        .await
    }

    pub async fn resume(&self, execution_id: Uuid) -> Result<()> {
        self.with_execution(execution_id, |execution, _, now| execution.resume(now))
            .await
    }

    /// One orchestration tick: enforce timeouts and the cancellation grace,
    /// then advance the DAG. Returns whether the execution changed.
    pub async fn tick(&self, execution_id: Uuid) -> Result<bool> {
        let (changed, stale) = self
            .with_execution(execution_id, |execution, queue, now| {
                Ok(self.tick_mutation(execution, queue, now))
            })
            .await?;
        self.forget_dispatches(stale).await;
        Ok(changed)
    }

    fn tick_mutation(
        &self,
        execution: &mut Execution,
        queue: &mut JobQueue,
        now: DateTime<Utc>,
    ) -> (bool, Vec<Uuid>) {
        let before = execution.clone();
        let grace = Duration::from_millis(self.config.cancellation_grace_ms);

        let mut stale: Vec<Uuid> = execution
            .enforce_timeouts(queue, now)
            .into_iter()
            .filter_map(|(_, token)| token)
            .collect();
        stale.extend(
            execution
                .expire_cancelled(grace, queue, now)
                .into_iter()
                .filter_map(|(_, token)| token),
        );
        execution.advance(queue, now);
        (*execution != before, stale)
    }

    // =========================================================================
    // Worker-facing API
    // =========================================================================

    pub async fn register_worker(
        &self,
        worker_id: &str,
        hostname: &str,
        capabilities: BTreeSet<String>,
        max_concurrency: u32,
    ) -> Result<WorkerRecord> {
        self.pool
            .register(worker_id, hostname, capabilities, max_concurrency)
            .await
    }

    /// Refresh the worker's liveness. Returns the dispatch tokens the worker
    /// holds for cancelled executions; the worker should abort them.
    pub async fn heartbeat(&self, worker_id: &str, current_load: u32) -> Result<Vec<Uuid>> {
        self.pool.heartbeat(worker_id, current_load).await?;
        self.cancelled_dispatches(worker_id).await
    }

    /// Remove the worker now; its in-flight nodes are returned to the queue
    /// by the next failover scan.
    pub async fn deregister_worker(&self, worker_id: &str) -> Result<bool> {
        self.pool.deregister(worker_id).await
    }

    pub async fn active_workers(&self) -> Result<Vec<WorkerRecord>> {
        self.pool.active_workers().await
    }

    async fn cancelled_dispatches(&self, worker_id: &str) -> Result<Vec<Uuid>> {
        Ok(self
            .state
            .list_executions()
            .await?
            .into_iter()
            .filter(|(execution, _)| execution.status == ExecutionStatus::Cancelled)
            .flat_map(|(execution, _)| {
                execution
                    .nodes_held_by(worker_id)
                    .into_iter()
                    .filter_map(|id| execution.node(&id).and_then(|n| n.dispatch_token))
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    /// Nodes currently dispatched to or running on `worker_id`, across all
    /// executions. Unlike the heartbeat's `current_load` this is never stale.
    pub async fn assigned_load(&self, worker_id: &str) -> Result<u32> {
        Ok(self
            .state
            .list_executions()
            .await?
            .iter()
            .map(|(execution, _)| execution.nodes_held_by(worker_id).len() as u32)
            .sum())
    }

    /// Hand the best queued entry this worker can run to it, or `None` when
    /// nothing is dispatchable or the worker has no free slot.
    pub async fn poll(&self, worker_id: &str) -> Result<Option<Dispatch>> {
        let now = Utc::now();
        let worker = self
            .pool
            .get(worker_id)
            .await?
            .filter(|w| w.is_alive(now, self.pool.config()))
            .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))?;
        let load = self.assigned_load(worker_id).await?;
        if load >= worker.max_concurrency {
            tracing::debug!(worker_id, load, max_concurrency = worker.max_concurrency, "Worker at capacity");
            return Ok(None);
        }

        loop {
            let Some((receipt, entry)) = self
                .queue
                .write()
                .await
                .dequeue(&worker.capabilities, Utc::now())
            else {
                return Ok(None);
            };

            let result = self
                .with_execution(entry.execution_id, |execution, _, now| {
                    let token = execution.record_dispatch(&entry.job_id, receipt, worker_id, now)?;
                    let definition = &execution.definitions[entry.job_id.as_str()];
                    let state = &execution.nodes[entry.job_id.as_str()];
                    Ok(Dispatch {
                        token,
                        execution_id: entry.execution_id,
                        node_id: entry.job_id.clone(),
                        handler_name: definition.handler_name.clone(),
                        config: definition.config.clone(),
                        attempt: state.attempt,
                        resource_limits: definition.resource_limits.clone(),
                        checkpoint_ref: state.checkpoint_ref.clone(),
                    })
                })
                .await;

            match result {
                Ok(dispatch) => {
                    self.state
                        .put_dispatch(
                            dispatch.token,
                            &DispatchRef {
                                execution_id: dispatch.execution_id,
                                node_id: dispatch.node_id.clone(),
                            },
                        )
                        .await?;
                    tracing::info!(
                        execution_id = %dispatch.execution_id,
                        node_id = %dispatch.node_id,
                        worker_id,
                        attempt = dispatch.attempt,
                        "Node dispatched"
                    );
                    return Ok(Some(dispatch));
                }
                // The execution no longer wants this entry; drop it
                Err(OrchestratorError::InvalidTransition(reason)) => {
                    tracing::debug!(execution_id = %entry.execution_id, job_id = %entry.job_id, reason = %reason, "Dropping stale queue entry");
                    self.queue.write().await.ack(receipt);
                }
                Err(OrchestratorError::ExecutionNotFound(_)) => {
                    self.queue.write().await.ack(receipt);
                }
                Err(e) => {
                    self.queue.write().await.release(receipt);
                    return Err(e);
                }
            }
        }
    }

    async fn resolve(&self, token: Uuid) -> Result<DispatchRef> {
        self.state
            .get_dispatch(token)
            .await?
            .ok_or(OrchestratorError::InvalidDispatchToken(token))
    }

    pub async fn report_started(&self, token: Uuid) -> Result<()> {
        let dispatch = self.resolve(token).await?;
        self.with_execution(dispatch.execution_id, |execution, _, now| {
            execution.record_started(&dispatch.node_id, token, now)
        })
        .await
    }

    pub async fn report_progress(&self, token: Uuid, progress: Progress) -> Result<()> {
        let dispatch = self.resolve(token).await?;
        self.with_execution(dispatch.execution_id, |execution, _, now| {
            execution.record_progress(
                &dispatch.node_id,
                token,
                progress.output.clone(),
                progress.checkpoint_ref.clone(),
                now,
            )
        })
        .await
    }

    pub async fn report_completed(&self, token: Uuid, output: Value) -> Result<()> {
        let dispatch = self.resolve(token).await?;
        self.with_execution(dispatch.execution_id, |execution, queue, now| {
            execution.record_completed(&dispatch.node_id, token, output.clone(), queue, now)
        })
        .await?;
        self.forget_dispatches(vec![token]).await;
        Ok(())
    }

    /// Record a failed attempt. `retryable = false` fails the node outright.
    pub async fn report_failed(&self, token: Uuid, error: &str, retryable: bool) -> Result<()> {
        let dispatch = self.resolve(token).await?;
        self.with_execution(dispatch.execution_id, |execution, queue, now| {
            execution.check_token(&dispatch.node_id, token)?;
            execution
                .record_failure(&dispatch.node_id, error, retryable, queue, now)
                .map(|_| ())
        })
        .await?;
        self.forget_dispatches(vec![token]).await;
        Ok(())
    }

    async fn forget_dispatches(&self, tokens: Vec<Uuid>) {
        for token in tokens {
            if let Err(e) = self.state.delete_dispatch(token).await {
                tracing::warn!(token = %token, error = %e, "Failed to remove dispatch token");
            }
        }
    }

    // =========================================================================
    // Observability
    // =========================================================================

    /// Queue statistics plus the number of pending entries no live worker
    /// can take right now.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let (mut stats, requirements) = {
            let queue = self.queue.read().await;
            let requirements: Vec<BTreeSet<String>> = queue
                .pending_entries()
                .into_iter()
                .map(|entry| entry.required_capabilities.clone())
                .collect();
            (queue.stats(Utc::now()), requirements)
        };

        let mut verdicts: Vec<(BTreeSet<String>, bool)> = Vec::new();
        for required in requirements {
            let schedulable = match verdicts.iter().find(|(caps, _)| *caps == required) {
                Some((_, ok)) => *ok,
                None => {
                    let ok = match self.pool.select_worker(&required).await {
                        Ok(_) => true,
                        Err(e @ OrchestratorError::NoCapableWorker(_)) => {
                            tracing::warn!(error = %e, "Queued work has no capable worker");
                            false
                        }
                        Err(e) => return Err(e),
                    };
                    verdicts.push((required, ok));
                    ok
                }
            };
            if !schedulable {
                stats.unschedulable += 1;
            }
        }
        Ok(stats)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.read().await.dead_letters().to_vec()
    }

    pub async fn health(&self) -> HealthReport {
        let (queue_full, depth) = {
            let queue = self.queue.read().await;
            (queue.is_full(), queue.len())
        };
        let queue = ComponentHealth {
            healthy: !queue_full,
            detail: if queue_full {
                format!("at capacity ({depth} entries)")
            } else {
                format!("{depth} entries")
            },
        };

        let (store, workers, active) = match self.pool.all_workers().await {
            Ok(all) => {
                let now = Utc::now();
                let active = all
                    .iter()
                    .filter(|w| w.is_alive(now, self.pool.config()))
                    .count();
                (
                    ComponentHealth {
                        healthy: true,
                        detail: "reachable".to_string(),
                    },
                    ComponentHealth {
                        healthy: active > 0,
                        detail: format!("{active} of {} workers alive", all.len()),
                    },
                    active,
                )
            }
            Err(e) => (
                ComponentHealth {
                    healthy: false,
                    detail: e.to_string(),
                },
                ComponentHealth {
                    healthy: false,
                    detail: "unknown".to_string(),
                },
                0,
            ),
        };

        HealthReport {
            healthy: queue.healthy && store.healthy,
            instance_id: self.config.instance_id.clone(),
            queue,
            store,
            workers,
            active_workers: active,
        }
    }

    // =========================================================================
    // Background loops
    // =========================================================================

    /// Tick every live execution whose lock is free. Executions abandoned by
    /// a crashed instance become free once their lock TTL runs out.
    pub async fn reconcile_once(&self) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        for (execution, _) in self.state.list_executions().await? {
            if !needs_attention(&execution) {
                continue;
            }
            summary.examined += 1;
            let execution_id = execution.execution_id;
            if self
                .state
                .lock_holder(&execution_resource(execution_id))
                .await?
                .is_some()
            {
                continue;
            }

            let mut mutate = |execution: &mut Execution,
                              queue: &mut JobQueue,
                              now: DateTime<Utc>|
             -> Result<(bool, Vec<Uuid>)> {
                Ok(self.tick_mutation(execution, queue, now))
            };
            match self.locked_update(execution_id, &mut mutate).await {
                Ok((changed, stale)) => {
                    self.forget_dispatches(stale).await;
                    if changed {
                        summary.updated += 1;
                        tracing::info!(execution_id = %execution_id, instance_id = %self.config.instance_id, "Execution reconciled");
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(execution_id = %execution_id, error = %e, "Execution busy, skipping");
                }
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "Reconciliation failed");
                }
            }
        }
        Ok(summary)
    }

    /// Return nodes held by dead or deregistered workers to the queue.
    pub async fn failover_scan(&self) -> Result<ScanSummary> {
        let live: HashSet<String> = self
            .pool
            .active_workers()
            .await?
            .into_iter()
            .map(|w| w.worker_id)
            .collect();

        let mut summary = ScanSummary::default();
        for (execution, _) in self.state.list_executions().await? {
            if execution.status.is_terminal() {
                continue;
            }
            let dead: HashSet<String> = execution
                .nodes
                .values()
                .filter(|n| n.status.is_in_flight())
                .filter_map(|n| n.assigned_worker_id.clone())
                .filter(|worker| !live.contains(worker))
                .collect();
            if dead.is_empty() {
                continue;
            }
            summary.examined += 1;

            let execution_id = execution.execution_id;
            let result = self
                .with_execution(execution_id, |execution, queue, now| {
                    Ok(execution.fail_lost_workers(&dead, queue, now))
                })
                .await;
            match result {
                Ok(reset) if !reset.is_empty() => {
                    summary.updated += 1;
                    for (node_id, _) in &reset {
                        tracing::warn!(execution_id = %execution_id, node_id = %node_id, workers = ?dead, "Worker lost, node returned to queue");
                    }
                    self.forget_dispatches(reset.into_iter().filter_map(|(_, t)| t).collect())
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "Failover of execution failed");
                }
            }
        }
        Ok(summary)
    }

    pub async fn run_reconciliation_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.reconcile_interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(instance_id = %self.config.instance_id, "Reconciliation loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        tracing::warn!(error = %e, "Reconciliation pass failed");
                    }
                }
            }
        }
    }

    pub async fn run_failover_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.pool.config().failover_scan_interval_ms,
        ));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(instance_id = %self.config.instance_id, "Failover loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    match self.failover_scan().await {
                        Ok(summary) if summary.updated > 0 => {
                            tracing::info!(executions = summary.updated, "Failover scan recovered work");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Failover scan failed"),
                    }
                }
            }
        }
    }

    // =========================================================================
    // Locked read-modify-write
    // =========================================================================

    /// Apply `mutate` to the execution under its lock, retrying lock
    /// contention and version conflicts locally with jittered backoff.
    async fn with_execution<T, F>(&self, execution_id: Uuid, mut mutate: F) -> Result<T>
    where
        F: FnMut(&mut Execution, &mut JobQueue, DateTime<Utc>) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match self.locked_update(execution_id, &mut mutate).await {
                Err(e) if e.is_transient() && attempt + 1 < self.config.transient_retry_attempts => {
                    let delay = self.transient_backoff(attempt);
                    tracing::debug!(
                        execution_id = %execution_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient contention, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn locked_update<T, F>(&self, execution_id: Uuid, mutate: &mut F) -> Result<T>
    where
        F: FnMut(&mut Execution, &mut JobQueue, DateTime<Utc>) -> Result<T>,
    {
        let resource = execution_resource(execution_id);
        let ttl = self.config.store.lock_ttl();
        let guard = self
            .state
            .acquire_lock(&resource, &self.config.instance_id, ttl)
            .await?;
        let started = Instant::now();

        let result = self.update_execution(execution_id, mutate, &guard.token, started).await;

        if let Err(e) = self.state.release_lock(&resource, guard.token).await {
            tracing::warn!(resource, error = %e, "Failed to release execution lock");
        }
        result
    }

    async fn update_execution<T, F>(
        &self,
        execution_id: Uuid,
        mutate: &mut F,
        lock_token: &Uuid,
        started: Instant,
    ) -> Result<T>
    where
        F: FnMut(&mut Execution, &mut JobQueue, DateTime<Utc>) -> Result<T>,
    {
        let (mut execution, version) = self
            .state
            .get_execution_state(execution_id)
            .await?
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))?;
        let before = execution.clone();

        let value = {
            let mut queue = self.queue.write().await;
            let now = Utc::now();
            let value = mutate(&mut execution, &mut *queue, now)?;
            execution.advance(&mut *queue, now);
            value
        };

        if execution != before {
            let ttl = self.config.store.lock_ttl();
            if started.elapsed() > ttl / 2 {
                let resource = execution_resource(execution_id);
                if !self.state.renew_lock(&resource, *lock_token, ttl).await? {
                    tracing::warn!(execution_id = %execution_id, "Lock expired during tick");
                }
            }
            self.state.put_execution_state(&execution, Some(version)).await?;
        }
        Ok(value)
    }

    /// `base * 2^attempt` plus up to 50% random jitter.
    fn transient_backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .transient_retry_base_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
            .min(self.config.store.lock_ttl_ms);
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }
}

/// Whether a reconciliation tick could change anything: live executions,
/// and cancelled ones whose running nodes have not been settled yet.
fn needs_attention(execution: &Execution) -> bool {
    match execution.status {
        ExecutionStatus::Completed | ExecutionStatus::Failed => false,
        ExecutionStatus::Cancelled => execution.nodes.values().any(|n| n.status.is_in_flight()),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            OrchestratorConfig::default().with_instance_id("test"),
            Arc::new(MemoryStore::new()),
            Arc::new(RwLock::new(JobQueue::default())),
        )
    }

    #[test]
    fn transient_backoff_grows_and_is_capped() {
        let orch = orchestrator();
        let first = orch.transient_backoff(0);
        assert!(first >= Duration::from_millis(20) && first <= Duration::from_millis(30));
        let capped = orch.transient_backoff(40);
        assert!(capped >= Duration::from_millis(30_000));
        assert!(capped <= Duration::from_millis(45_000));
    }

    #[tokio::test]
    async fn submit_queues_roots() {
        let orch = orchestrator();
        let id = orch
            .submit(
                "wf",
                vec![JobNode::new("a", "echo"), JobNode::new("b", "echo").depends_on("a")],
            )
            .await
            .unwrap();

        let execution = orch.get_execution(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(orch.queue.read().await.len(), 1);
    }

    #[tokio::test]
    async fn poll_requires_live_registration() {
        let orch = orchestrator();
        assert!(matches!(
            orch.poll("ghost").await,
            Err(OrchestratorError::WorkerNotFound(_))
        ));
    }

    #[test]
    fn terminal_executions_need_no_attention() {
        let mut execution = Execution::new("wf", vec![JobNode::new("a", "echo")], Utc::now());
        assert!(needs_attention(&execution));
        execution.status = ExecutionStatus::Completed;
        assert!(!needs_attention(&execution));
    }
}
