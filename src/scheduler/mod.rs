//! Dispatch plumbing: the job data model, the priority job queue and the
//! worker pool manager.

pub mod job;
pub mod pool;
pub mod queue;

pub use job::{JobNode, JobRunState, NodeStatus, ResourceLimits, RetryPolicy};
pub use pool::{WorkerPool, WorkerRecord};
pub use queue::{DeadLetter, JobQueue, NackOutcome, QueueEntry, QueueStats, Receipt};
