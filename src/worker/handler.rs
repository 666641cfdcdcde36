use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::JobExecutionError;
use crate::orchestrator::engine::Progress;
use crate::scheduler::job::ResourceLimits;
use crate::worker::executor::ShellHandler;
use crate::worker::runtime::ControlPlane;

/// What a handler knows about the dispatch it is running.
#[derive(Clone)]
pub struct JobContext {
    pub execution_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    pub resource_limits: ResourceLimits,
    /// Checkpoint recorded by an earlier attempt, if any
    pub checkpoint_ref: Option<String>,
    /// Fired when the execution is cancelled
    pub cancel: CancellationToken,
    pub(crate) reporter: Option<ProgressReporter>,
}

#[derive(Clone)]
pub(crate) struct ProgressReporter {
    control: Arc<dyn ControlPlane>,
    token: Uuid,
}

impl JobContext {
    pub fn new(execution_id: Uuid, node_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            attempt: 0,
            resource_limits: ResourceLimits::default(),
            checkpoint_ref: None,
            cancel: CancellationToken::new(),
            reporter: None,
        }
    }

    pub(crate) fn with_reporter(mut self, control: Arc<dyn ControlPlane>, token: Uuid) -> Self {
        self.reporter = Some(ProgressReporter { control, token });
        self
    }

    /// Send partial output and/or a checkpoint reference to the
    /// orchestrator. Best effort: failures are logged, not returned.
    pub async fn report_progress(&self, progress: Progress) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        if let Err(e) = reporter.control.progress(reporter.token, progress).await {
            tracing::warn!(
                execution_id = %self.execution_id,
                node_id = %self.node_id,
                error = %e,
                "Failed to report progress"
            );
        }
    }
}

/// Job logic behind a `handler_name`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, config: &Value, ctx: &JobContext) -> Result<Value, JobExecutionError>;
}

/// Returns its config as output. Honours an optional `sleep_ms` field so it
/// can stand in for a long-running job.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn execute(&self, config: &Value, ctx: &JobContext) -> Result<Value, JobExecutionError> {
        if let Some(ms) = config.get("sleep_ms").and_then(Value::as_u64) {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(JobExecutionError::permanent("cancelled"));
                }
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            }
        }
        Ok(config.clone())
    }
}

/// Name to handler map. New job types are added by registering a handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `echo` and `shell` handlers.
    pub fn with_builtins(sandbox: SandboxConfig) -> Self {
        let mut registry = Self::new();
        registry.register("echo", EchoHandler);
        registry.register("shell", ShellHandler::new(sandbox));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
