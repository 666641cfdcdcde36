//! DAG orchestration.
//!
//! [`Execution`] holds the per-run state machine and is pure: it mutates
//! itself and the job queue and nothing else. [`Orchestrator`] wraps it with
//! the distributed lock, optimistic state writes, worker dispatch and the
//! background reconciliation and failover loops.

pub mod condition;
pub mod dag;
pub mod engine;
pub mod execution;

pub use condition::Condition;
pub use engine::{Dispatch, HealthReport, Orchestrator, Progress, ScanSummary};
pub use execution::{Execution, ExecutionStatus, FailureSummary};
