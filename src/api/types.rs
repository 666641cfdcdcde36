use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::orchestrator::execution::{Execution, ExecutionStatus, FailureSummary};
use crate::scheduler::job::{JobNode, NodeStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitExecutionRequest {
    pub workflow_id: String,
    pub nodes: Vec<JobNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitExecutionResponse {
    pub execution_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatusResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub current_load: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Dispatches the worker should abort
    pub cancelled: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub output: Value,
}

fn default_retryable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailRequest {
    pub error: String,
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Per-node state as shown to API clients. Dispatch tokens and queue
/// receipts stay internal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub handler_name: String,
    pub depends_on: BTreeSet<String>,
    pub status: NodeStatus,
    pub attempt: u32,
    pub assigned_worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub checkpoint_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionView {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure: Option<FailureSummary>,
    pub nodes: BTreeMap<String, NodeView>,
}

impl From<&Execution> for ExecutionView {
    fn from(execution: &Execution) -> Self {
        let nodes = execution
            .nodes
            .iter()
            .filter_map(|(id, state)| {
                let definition = execution.definitions.get(id)?;
                Some((
                    id.clone(),
                    NodeView {
                        handler_name: definition.handler_name.clone(),
                        depends_on: definition.depends_on.clone(),
                        status: state.status,
                        attempt: state.attempt,
                        assigned_worker_id: state.assigned_worker_id.clone(),
                        started_at: state.started_at,
                        finished_at: state.finished_at,
                        output: state.output.clone(),
                        error: state.error.clone(),
                        checkpoint_ref: state.checkpoint_ref.clone(),
                    },
                ))
            })
            .collect();

        Self {
            execution_id: execution.execution_id,
            workflow_id: execution.workflow_id.clone(),
            status: execution.status,
            created_at: execution.created_at,
            updated_at: execution.updated_at,
            failure: execution.failure.clone(),
            nodes,
        }
    }
}
