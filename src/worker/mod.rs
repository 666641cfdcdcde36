//! Worker side: job handlers and the process that runs them.
//!
//! # Components
//!
//! - [`JobHandler`] / [`HandlerRegistry`]: `handler_name` to job logic
//! - [`JobExecutor`]: runs a dispatch under its timeout and cancellation
//! - [`heartbeat`]: keeps the worker registered as alive
//! - [`WorkerRuntime`]: register, heartbeat, poll, execute, report
//!
//! # Execution Flow
//!
//! 1. The runtime polls while its load is below `max_concurrency`
//! 2. Each [`Dispatch`](crate::orchestrator::Dispatch) runs on its own task
//! 3. The handler's output or error goes back through the [`ControlPlane`]
//!    with the dispatch token

pub mod executor;
pub mod handler;
pub mod heartbeat;
pub mod runtime;

pub use executor::{JobExecutor, ShellHandler};
pub use handler::{EchoHandler, HandlerRegistry, JobContext, JobHandler};
pub use runtime::{ControlPlane, LocalControlPlane, WorkerRegistration, WorkerRuntime};
