use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::orchestrator::condition::Condition;
use crate::scheduler::queue::Receipt;

pub const DEFAULT_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
        }
    }
}

/// One node of a submitted DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNode {
    pub id: String,
    pub handler_name: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl JobNode {
    pub fn new(id: impl Into<String>, handler_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handler_name: handler_name.into(),
            config: Value::Null,
            depends_on: BTreeSet::new(),
            condition: None,
            resource_limits: ResourceLimits::default(),
            retry_policy: RetryPolicy::default(),
            priority: DEFAULT_PRIORITY,
            required_capabilities: BTreeSet::new(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_base_ms: u64) -> Self {
        self.retry_policy = RetryPolicy {
            max_attempts,
            backoff_base_ms,
        };
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.resource_limits.max_execution_time_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Waiting,
    Ready,
    Queued,
    Dispatched,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl NodeStatus {
    /// Satisfies a dependent's dependency
    pub fn is_satisfied(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Skipped)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Skipped | NodeStatus::Failed
        )
    }

    /// Held by a worker
    pub fn is_in_flight(&self) -> bool {
        matches!(self, NodeStatus::Dispatched | NodeStatus::Running)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Waiting => write!(f, "waiting"),
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::Queued => write!(f, "queued"),
            NodeStatus::Dispatched => write!(f, "dispatched"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Completed => write!(f, "completed"),
            NodeStatus::Skipped => write!(f, "skipped"),
            NodeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-node run record nested in an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunState {
    pub status: NodeStatus,
    pub attempt: u32,
    pub assigned_worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Authenticates the current dispatch's callbacks
    pub dispatch_token: Option<Uuid>,
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Queue receipt while the node is queued or in flight
    pub receipt: Option<Receipt>,
    /// Reference into the external checkpoint store
    pub checkpoint_ref: Option<String>,
    /// Earliest time the next attempt may be dispatched
    #[serde(default)]
    pub retry_not_before: Option<DateTime<Utc>>,
}

impl Default for JobRunState {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRunState {
    pub fn new() -> Self {
        Self {
            status: NodeStatus::Waiting,
            attempt: 0,
            assigned_worker_id: None,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
            dispatch_token: None,
            dispatched_at: None,
            receipt: None,
            checkpoint_ref: None,
            retry_not_before: None,
        }
    }

    /// Drop everything tied to the current dispatch.
    pub fn clear_dispatch(&mut self) {
        self.assigned_worker_id = None;
        self.dispatch_token = None;
        self.dispatched_at = None;
        self.receipt = None;
    }
}
