use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::condition::DependencyOutputs;
use crate::scheduler::job::{JobNode, JobRunState, NodeStatus};
use crate::scheduler::queue::{JobQueue, NackOutcome, QueueEntry, Receipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Paused => write!(f, "paused"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// First node that failed terminally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub node_id: String,
    pub error: String,
}

/// What happened to a node after a failure was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in the queue (or back to `ready` while paused) for another attempt
    Retrying { attempt: u32 },
    /// Retry budget exhausted or error not retryable
    Failed,
}

/// One run of a DAG. All orchestration state lives here so any orchestrator
/// instance can resume it from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub definitions: BTreeMap<String, JobNode>,
    pub nodes: BTreeMap<String, JobRunState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure: Option<FailureSummary>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Build a pending execution from an already validated node list.
    pub fn new(workflow_id: impl Into<String>, nodes: Vec<JobNode>, now: DateTime<Utc>) -> Self {
        let states = nodes
            .iter()
            .map(|n| (n.id.clone(), JobRunState::new()))
            .collect();
        Self {
            execution_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            definitions: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            nodes: states,
            created_at: now,
            updated_at: now,
            failure: None,
            cancelled_at: None,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&JobRunState> {
        self.nodes.get(node_id)
    }

    fn node_mut(&mut self, node_id: &str) -> Result<&mut JobRunState> {
        self.nodes.get_mut(node_id).ok_or_else(|| {
            OrchestratorError::InvalidTransition(format!("unknown node '{node_id}'"))
        })
    }

    fn definition(&self, node_id: &str) -> Result<&JobNode> {
        self.definitions.get(node_id).ok_or_else(|| {
            OrchestratorError::InvalidTransition(format!("unknown node '{node_id}'"))
        })
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// Node ids currently held by `worker_id`.
    pub fn nodes_held_by(&self, worker_id: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.status.is_in_flight())
            .filter(|(_, n)| n.assigned_worker_id.as_deref() == Some(worker_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn dependency_outputs(&self, node_id: &str) -> DependencyOutputs {
        let Some(def) = self.definitions.get(node_id) else {
            return DependencyOutputs::new();
        };
        def.depends_on
            .iter()
            .map(|dep| {
                let output = self.nodes.get(dep).and_then(|s| s.output.clone());
                (dep.clone(), output)
            })
            .collect()
    }

    /// Drive the DAG forward: promote nodes whose dependencies are all
    /// satisfied, evaluate conditions of ready nodes, enqueue the ones that
    /// run, and settle the execution status. Returns whether anything
    /// changed.
    pub fn advance(&mut self, queue: &mut JobQueue, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        let mut changed = self.requeue_lost(queue);
        if self.status == ExecutionStatus::Pending {
            self.status = ExecutionStatus::Running;
            changed = true;
            tracing::info!(execution_id = %self.execution_id, workflow_id = %self.workflow_id, "Execution running");
        }

        loop {
            let mut progressed = self.promote_waiting();
            if self.status == ExecutionStatus::Running {
                progressed |= self.dispatch_ready(queue, now);
            }
            if !progressed {
                break;
            }
            changed = true;
        }

        changed |= self.settle(now);
        if changed {
            self.updated_at = now;
        }
        changed
    }

    /// Return `queued` nodes whose entry is missing from `queue` to `ready`,
    /// so they are enqueued again. Happens when the queue that held them
    /// was lost with its process.
    fn requeue_lost(&mut self, queue: &JobQueue) -> bool {
        let execution_id = self.execution_id;
        let mut changed = false;
        for (id, state) in self.nodes.iter_mut() {
            if state.status == NodeStatus::Queued && !queue.contains(execution_id, id) {
                tracing::warn!(execution_id = %execution_id, node_id = %id, "Queue entry missing, re-queueing node");
                state.status = NodeStatus::Ready;
                state.receipt = None;
                changed = true;
            }
        }
        changed
    }

    fn promote_waiting(&mut self) -> bool {
        let promotable: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, state)| state.status == NodeStatus::Waiting)
            .filter(|(id, _)| {
                self.definitions[id.as_str()].depends_on.iter().all(|dep| {
                    self.nodes
                        .get(dep)
                        .is_some_and(|s| s.status.is_satisfied())
                })
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &promotable {
            if let Some(state) = self.nodes.get_mut(id) {
                state.status = NodeStatus::Ready;
            }
        }
        !promotable.is_empty()
    }

    fn dispatch_ready(&mut self, queue: &mut JobQueue, now: DateTime<Utc>) -> bool {
        let ready: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, state)| state.status == NodeStatus::Ready)
            .map(|(id, _)| id.clone())
            .collect();

        let mut progressed = false;
        for id in ready {
            let def = &self.definitions[id.as_str()];
            let runs = def
                .condition
                .as_ref()
                .map_or(true, |c| c.evaluate(&self.dependency_outputs(&id)));

            if !runs {
                if let Some(state) = self.nodes.get_mut(&id) {
                    state.status = NodeStatus::Skipped;
                    state.finished_at = Some(now);
                }
                tracing::info!(execution_id = %self.execution_id, node_id = %id, "Condition false, node skipped");
                progressed = true;
                continue;
            }

            let attempt = self.nodes[id.as_str()].attempt;
            let mut entry = QueueEntry::for_node(self.execution_id, def, attempt, now);
            if let Some(not_before) = self.nodes[id.as_str()].retry_not_before {
                entry.available_at = entry.available_at.max(not_before);
            }
            match queue.enqueue(entry, def.priority) {
                Ok(receipt) => {
                    if let Some(state) = self.nodes.get_mut(&id) {
                        state.status = NodeStatus::Queued;
                        state.receipt = Some(receipt);
                    }
                    tracing::debug!(execution_id = %self.execution_id, node_id = %id, attempt, "Node queued");
                    progressed = true;
                }
                // Stays ready; the next tick tries again
                Err(e) => {
                    tracing::warn!(execution_id = %self.execution_id, node_id = %id, error = %e, "Failed to enqueue node");
                }
            }
        }
        progressed
    }

    /// Move the execution to `completed` or `failed` when the node states
    /// allow no other outcome.
    fn settle(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        if self.nodes.values().all(|n| n.status.is_satisfied()) {
            self.status = ExecutionStatus::Completed;
            self.updated_at = now;
            tracing::info!(execution_id = %self.execution_id, "Execution completed");
            return true;
        }

        let any_failed = self.nodes.values().any(|n| n.status == NodeStatus::Failed);
        let any_active = self.nodes.values().any(|n| {
            matches!(n.status, NodeStatus::Ready | NodeStatus::Queued) || n.status.is_in_flight()
        });
        if any_failed && !any_active {
            self.status = ExecutionStatus::Failed;
            self.updated_at = now;
            tracing::warn!(
                execution_id = %self.execution_id,
                failed_node = ?self.failure.as_ref().map(|f| &f.node_id),
                "Execution failed"
            );
            return true;
        }
        false
    }

    /// Confirm `token` is the live dispatch token of `node_id`.
    pub fn check_token(&self, node_id: &str, token: Uuid) -> Result<&JobRunState> {
        match self.nodes.get(node_id) {
            Some(state) if state.dispatch_token == Some(token) && state.status.is_in_flight() => {
                Ok(state)
            }
            _ => Err(OrchestratorError::InvalidDispatchToken(token)),
        }
    }

    /// Record that the queue entry `receipt` for `node_id` went to
    /// `worker_id`. Returns the new dispatch token.
    pub fn record_dispatch(
        &mut self,
        node_id: &str,
        receipt: Receipt,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        if self.status != ExecutionStatus::Running {
            return Err(OrchestratorError::InvalidTransition(format!(
                "execution {} is {}",
                self.execution_id, self.status
            )));
        }
        let state = self.node_mut(node_id)?;
        if state.status != NodeStatus::Queued || state.receipt != Some(receipt) {
            return Err(OrchestratorError::InvalidTransition(format!(
                "node '{node_id}' is {} and not waiting for this delivery",
                state.status
            )));
        }

        let token = Uuid::new_v4();
        state.status = NodeStatus::Dispatched;
        state.assigned_worker_id = Some(worker_id.to_string());
        state.dispatch_token = Some(token);
        state.dispatched_at = Some(now);
        state.started_at = None;
        state.retry_not_before = None;
        self.updated_at = now;
        Ok(token)
    }

    pub fn record_started(&mut self, node_id: &str, token: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.check_token(node_id, token)?;
        let state = self.node_mut(node_id)?;
        if state.status == NodeStatus::Dispatched {
            state.status = NodeStatus::Running;
            state.started_at = Some(now);
            self.updated_at = now;
        }
        Ok(())
    }

    pub fn record_progress(
        &mut self,
        node_id: &str,
        token: Uuid,
        output: Option<Value>,
        checkpoint_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_token(node_id, token)?;
        let state = self.node_mut(node_id)?;
        if output.is_some() {
            state.output = output;
        }
        if checkpoint_ref.is_some() {
            state.checkpoint_ref = checkpoint_ref;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn record_completed(
        &mut self,
        node_id: &str,
        token: Uuid,
        output: Value,
        queue: &mut JobQueue,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_token(node_id, token)?;
        let execution_id = self.execution_id;
        let state = self.node_mut(node_id)?;
        if let Some(receipt) = state.receipt {
            queue.ack(receipt);
        }
        state.status = NodeStatus::Completed;
        state.output = Some(output);
        state.error = None;
        state.finished_at = Some(now);
        if state.started_at.is_none() {
            state.started_at = state.dispatched_at;
        }
        let worker = state.assigned_worker_id.take();
        state.clear_dispatch();
        state.assigned_worker_id = worker;
        self.updated_at = now;
        tracing::info!(execution_id = %execution_id, node_id, "Node completed");
        Ok(())
    }

    /// Record a failure of an in-flight node and apply its retry policy
    /// through the queue's nack path.
    pub fn record_failure(
        &mut self,
        node_id: &str,
        error: &str,
        retryable: bool,
        queue: &mut JobQueue,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let execution_id = self.execution_id;
        let status = self.status;
        let def = self.definition(node_id)?.clone();
        let state = self.node_mut(node_id)?;
        if !state.status.is_in_flight() {
            return Err(OrchestratorError::InvalidTransition(format!(
                "node '{node_id}' is {} and cannot fail",
                state.status
            )));
        }

        let may_retry = retryable && !status.is_terminal();
        let outcome = match (state.receipt, may_retry) {
            (Some(receipt), true) => queue.nack(receipt, error, now),
            (Some(receipt), false) => {
                queue.reject(receipt, error, now);
                None
            }
            (None, _) => None,
        };

        state.error = Some(error.to_string());
        state.started_at = None;
        state.clear_dispatch();

        let next_attempt = match outcome {
            Some(NackOutcome::Requeued {
                receipt,
                attempt,
                delay,
            }) => Some((attempt, Some(receipt), delay)),
            Some(NackOutcome::DeadLettered { attempt }) => {
                state.attempt = attempt;
                None
            }
            // The entry is gone from the queue (not ours anymore, or the
            // error is permanent); fall back to the node's own policy.
            None if may_retry && state.attempt + 1 < def.retry_policy.max_attempts => {
                let attempt = state.attempt + 1;
                let delay = queue.backoff_delay(def.retry_policy.backoff_base_ms, state.attempt);
                let mut entry = QueueEntry::for_node(execution_id, &def, attempt, now);
                entry.available_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                match queue.enqueue(entry, def.priority) {
                    Ok(receipt) => Some((attempt, Some(receipt), delay)),
                    Err(_) => Some((attempt, None, delay)),
                }
            }
            None => {
                state.attempt += 1;
                None
            }
        };

        match next_attempt {
            Some((attempt, receipt, delay)) => {
                state.attempt = attempt;
                state.retry_not_before =
                    Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
                match receipt {
                    Some(receipt) if status == ExecutionStatus::Running => {
                        state.status = NodeStatus::Queued;
                        state.receipt = Some(receipt);
                    }
                    _ => {
                        // Paused, or the queue refused it: wait as ready
                        queue.withdraw(execution_id, node_id);
                        state.status = NodeStatus::Ready;
                    }
                }
                tracing::warn!(execution_id = %execution_id, node_id, attempt, error, "Node failed, retrying");
                self.updated_at = now;
                Ok(FailureOutcome::Retrying { attempt })
            }
            None => {
                state.status = NodeStatus::Failed;
                state.finished_at = Some(now);
                tracing::warn!(execution_id = %execution_id, node_id, attempt = state.attempt, error, "Node failed permanently");
                if self.failure.is_none() {
                    self.failure = Some(FailureSummary {
                        node_id: node_id.to_string(),
                        error: error.to_string(),
                    });
                }
                self.updated_at = now;
                Ok(FailureOutcome::Failed)
            }
        }
    }

    /// Fail in-flight nodes that exceeded `max_execution_time_ms`. Returns
    /// the affected node ids with their dispatch tokens.
    pub fn enforce_timeouts(
        &mut self,
        queue: &mut JobQueue,
        now: DateTime<Utc>,
    ) -> Vec<(String, Option<Uuid>)> {
        let timed_out: Vec<(String, Option<Uuid>, u64)> = self
            .nodes
            .iter()
            .filter(|(_, s)| s.status.is_in_flight())
            .filter_map(|(id, s)| {
                let limit = self.definitions[id.as_str()]
                    .resource_limits
                    .max_execution_time_ms?;
                let since = s.dispatched_at?;
                ((now - since).num_milliseconds() > limit as i64)
                    .then(|| (id.clone(), s.dispatch_token, limit))
            })
            .collect();

        let mut affected = Vec::new();
        for (id, token, limit) in timed_out {
            let error = format!("timed out after {limit}ms");
            if self.record_failure(&id, &error, true, queue, now).is_ok() {
                affected.push((id, token));
            }
        }
        affected
    }

    /// Return the nodes held by workers in `dead` to the queue, counting the
    /// loss as a failed attempt.
    pub fn fail_lost_workers(
        &mut self,
        dead: &HashSet<String>,
        queue: &mut JobQueue,
        now: DateTime<Utc>,
    ) -> Vec<(String, Option<Uuid>)> {
        let lost: Vec<(String, String, Option<Uuid>)> = self
            .nodes
            .iter()
            .filter(|(_, s)| s.status.is_in_flight())
            .filter_map(|(id, s)| {
                let worker = s.assigned_worker_id.as_ref()?;
                dead.contains(worker)
                    .then(|| (id.clone(), worker.clone(), s.dispatch_token))
            })
            .collect();

        let mut affected = Vec::new();
        for (id, worker, token) in lost {
            let error = OrchestratorError::WorkerTimeout(worker).to_string();
            if self.record_failure(&id, &error, true, queue, now).is_ok() {
                affected.push((id, token));
            }
        }
        affected
    }

    /// Cancel the execution. Queued work is withdrawn without consuming an
    /// attempt; returns the dispatch tokens of in-flight nodes, whose
    /// workers are asked to abort.
    pub fn cancel(&mut self, queue: &mut JobQueue, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        if self.status == ExecutionStatus::Cancelled {
            return Ok(self.in_flight_tokens());
        }
        if self.status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition(format!(
                "execution {} is already {}",
                self.execution_id, self.status
            )));
        }

        self.withdraw_queued(queue);
        self.status = ExecutionStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.updated_at = now;
        tracing::info!(execution_id = %self.execution_id, "Execution cancelled");
        Ok(self.in_flight_tokens())
    }

    /// Force-fail nodes of a cancelled execution whose workers did not abort
    /// within `grace`.
    pub fn expire_cancelled(
        &mut self,
        grace: Duration,
        queue: &mut JobQueue,
        now: DateTime<Utc>,
    ) -> Vec<(String, Option<Uuid>)> {
        let Some(cancelled_at) = self.cancelled_at else {
            return Vec::new();
        };
        if self.status != ExecutionStatus::Cancelled
            || (now - cancelled_at).num_milliseconds() < grace.as_millis() as i64
        {
            return Vec::new();
        }

        let execution_id = self.execution_id;
        let mut affected = Vec::new();
        for (id, state) in self.nodes.iter_mut() {
            if !state.status.is_in_flight() {
                continue;
            }
            queue.withdraw(execution_id, id);
            affected.push((id.clone(), state.dispatch_token));
            state.status = NodeStatus::Failed;
            state.error = Some("cancelled".to_string());
            state.finished_at = Some(now);
            state.clear_dispatch();
            tracing::warn!(execution_id = %execution_id, node_id = %id, "Node force-failed after cancellation grace");
        }
        if !affected.is_empty() {
            self.updated_at = now;
        }
        affected
    }

    pub fn pause(&mut self, queue: &mut JobQueue, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            ExecutionStatus::Paused => Ok(()),
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                self.withdraw_queued(queue);
                self.status = ExecutionStatus::Paused;
                self.updated_at = now;
                tracing::info!(execution_id = %self.execution_id, "Execution paused");
                Ok(())
            }
            other => Err(OrchestratorError::InvalidTransition(format!(
                "cannot pause a {other} execution"
            ))),
        }
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            ExecutionStatus::Running => Ok(()),
            ExecutionStatus::Paused => {
                self.status = ExecutionStatus::Running;
                self.updated_at = now;
                tracing::info!(execution_id = %self.execution_id, "Execution resumed");
                Ok(())
            }
            other => Err(OrchestratorError::InvalidTransition(format!(
                "cannot resume a {other} execution"
            ))),
        }
    }

    fn withdraw_queued(&mut self, queue: &mut JobQueue) {
        let execution_id = self.execution_id;
        for (id, state) in self.nodes.iter_mut() {
            if state.status == NodeStatus::Queued {
                queue.withdraw(execution_id, id);
                state.status = NodeStatus::Ready;
                state.receipt = None;
            }
        }
    }

    fn in_flight_tokens(&self) -> Vec<Uuid> {
        self.nodes
            .values()
            .filter(|n| n.status.is_in_flight())
            .filter_map(|n| n.dispatch_token)
            .collect()
    }
}
