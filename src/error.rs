use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Cyclic graph: dependency cycle involving node {0}")]
    CyclicGraph(String),

    #[error("Invalid DAG: {0}")]
    InvalidDag(String),

    #[error("No capable worker for capabilities {0:?}")]
    NoCapableWorker(Vec<String>),

    #[error("Lock on {resource} is held by {holder}")]
    LockHeld { resource: String, holder: String },

    #[error("Version conflict on {key}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Job execution failed: {0}")]
    JobExecution(String),

    #[error("Worker {0} stopped heartbeating")]
    WorkerTimeout(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Invalid or stale dispatch token: {0}")]
    InvalidDispatchToken(Uuid),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Job queue is at capacity ({0} entries)")]
    QueueFull(usize),

    #[error("Invalid priority {0}, expected 1..=10")]
    InvalidPriority(u8),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request rejected with {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Infrastructure contention that callers retry locally instead of
    /// surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::LockHeld { .. } | OrchestratorError::VersionConflict { .. }
        )
    }
}

impl OrchestratorError {
    /// Stable snake_case name of the variant, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::CyclicGraph(_) => "cyclic_graph",
            OrchestratorError::InvalidDag(_) => "invalid_dag",
            OrchestratorError::NoCapableWorker(_) => "no_capable_worker",
            OrchestratorError::LockHeld { .. } => "lock_held",
            OrchestratorError::VersionConflict { .. } => "version_conflict",
            OrchestratorError::JobExecution(_) => "job_execution",
            OrchestratorError::WorkerTimeout(_) => "worker_timeout",
            OrchestratorError::ExecutionNotFound(_) => "execution_not_found",
            OrchestratorError::WorkerNotFound(_) => "worker_not_found",
            OrchestratorError::InvalidDispatchToken(_) => "invalid_dispatch_token",
            OrchestratorError::InvalidTransition(_) => "invalid_transition",
            OrchestratorError::QueueFull(_) => "queue_full",
            OrchestratorError::InvalidPriority(_) => "invalid_priority",
            OrchestratorError::Serialization(_) => "serialization",
            OrchestratorError::Http(_) => "http",
            OrchestratorError::Api { .. } => "api",
            OrchestratorError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error returned by a job handler. `retryable = false` sends the node
/// straight to `failed` regardless of the remaining retry budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct JobExecutionError {
    pub message: String,
    pub retryable: bool,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<JobExecutionError> for OrchestratorError {
    fn from(err: JobExecutionError) -> Self {
        OrchestratorError::JobExecution(err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_version_errors_are_transient() {
        let held = OrchestratorError::LockHeld {
            resource: "execution/1".to_string(),
            holder: "orchestrator-a".to_string(),
        };
        let conflict = OrchestratorError::VersionConflict {
            key: "execution/1".to_string(),
            expected: Some(1),
            found: Some(2),
        };
        assert!(held.is_transient());
        assert!(conflict.is_transient());
        assert!(!OrchestratorError::CyclicGraph("a".to_string()).is_transient());
        assert!(!OrchestratorError::JobExecution("boom".to_string()).is_transient());
    }

    #[test]
    fn job_execution_error_constructors() {
        assert!(JobExecutionError::new("flaky").retryable);
        assert!(!JobExecutionError::permanent("bad config").retryable);
        assert_eq!(JobExecutionError::new("flaky").to_string(), "flaky");
    }
}
