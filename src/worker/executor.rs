use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::error::JobExecutionError;
use crate::orchestrator::engine::Dispatch;
use crate::scheduler::job::ResourceLimits;
use crate::worker::handler::{HandlerRegistry, JobContext, JobHandler};

/// Runs `config.command` with `sh -c`.
///
/// With the sandbox enabled the command runs in a Docker container with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits, taken from the node's resource limits when set
///
/// Output is `{"exit_code", "stdout", "stderr"}`; a non-zero exit is a
/// retryable failure.
#[derive(Debug, Clone)]
pub struct ShellHandler {
    config: SandboxConfig,
}

impl ShellHandler {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn docker_args(&self, command: &str, limits: &ResourceLimits) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }

        match (limits.max_memory_mb, &self.config.memory_limit) {
            (Some(mb), _) => args.push(format!("--memory={mb}m")),
            (None, Some(limit)) => args.push(format!("--memory={limit}")),
            (None, None) => {}
        }

        match (limits.max_cpu_percent, &self.config.cpu_limit) {
            (Some(percent), _) => args.push(format!("--cpus={:.2}", f64::from(percent) / 100.0)),
            (None, Some(limit)) => args.push(format!("--cpus={limit}")),
            (None, None) => {}
        }

        // Drop all capabilities, no new privileges, read-only root
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push(self.config.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(command.to_string());
        args
    }

    fn command(&self, command: &str, limits: &ResourceLimits) -> Command {
        let mut cmd = if self.config.enabled {
            let mut cmd = Command::new("docker");
            cmd.args(self.docker_args(command, limits));
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn process_output(
        ctx: &JobContext,
        result: std::io::Result<std::process::Output>,
    ) -> Result<Value, JobExecutionError> {
        let output = result.map_err(|e| {
            tracing::error!(execution_id = %ctx.execution_id, node_id = %ctx.node_id, error = %e, "Failed to spawn shell job");
            JobExecutionError::new(e.to_string())
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        tracing::info!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            exit_code = ?exit_code,
            "Shell job finished"
        );

        if output.status.success() {
            Ok(json!({
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            }))
        } else if stderr.trim().is_empty() {
            Err(JobExecutionError::new(format!("Exit code: {exit_code:?}")))
        } else {
            Err(JobExecutionError::new(stderr.trim().to_string()))
        }
    }
}

#[async_trait]
impl JobHandler for ShellHandler {
    async fn execute(&self, config: &Value, ctx: &JobContext) -> Result<Value, JobExecutionError> {
        let command = config
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| JobExecutionError::permanent("shell job needs a string 'command'"))?;

        tracing::info!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            command,
            sandboxed = self.config.enabled,
            "Executing shell job"
        );

        let mut cmd = self.command(command, &ctx.resource_limits);
        let child = cmd.output();
        tokio::select! {
            // Dropping the future kills the child
            _ = ctx.cancel.cancelled() => Err(JobExecutionError::permanent("cancelled")),
            result = child => Self::process_output(ctx, result),
        }
    }
}

/// Runs dispatches through the handler registry, bounded by the node's
/// `max_execution_time_ms` and a per-dispatch cancellation token.
#[derive(Clone)]
pub struct JobExecutor {
    registry: Arc<HandlerRegistry>,
}

impl JobExecutor {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn with_sandbox(config: SandboxConfig) -> Self {
        Self::new(HandlerRegistry::with_builtins(config))
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn execute(
        &self,
        dispatch: &Dispatch,
        ctx: JobContext,
    ) -> Result<Value, JobExecutionError> {
        let Some(handler) = self.registry.get(&dispatch.handler_name) else {
            return Err(JobExecutionError::permanent(format!(
                "no handler registered for '{}'",
                dispatch.handler_name
            )));
        };

        let cancel: CancellationToken = ctx.cancel.clone();
        let run = handler.execute(&dispatch.config, &ctx);
        let limited = async {
            match dispatch.resource_limits.max_execution_time_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), run)
                    .await
                    .unwrap_or_else(|_| {
                        Err(JobExecutionError::new(format!("timed out after {ms}ms")))
                    }),
                None => run.await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(JobExecutionError::permanent("cancelled")),
            result = limited => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_args_prefer_node_limits() {
        let handler = ShellHandler::new(SandboxConfig {
            enabled: true,
            ..SandboxConfig::default()
        });
        let limits = ResourceLimits {
            max_memory_mb: Some(512),
            max_cpu_percent: Some(150),
            max_execution_time_ms: None,
        };
        let args = handler.docker_args("echo hi", &limits);
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--cpus=1.50".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("echo hi"));
    }

    #[test]
    fn docker_args_fall_back_to_sandbox_defaults() {
        let handler = ShellHandler::new(SandboxConfig::default());
        let args = handler.docker_args("true", &ResourceLimits::default());
        assert!(args.contains(&"--memory=256m".to_string()));
        assert!(args.contains(&"--cpus=0.5".to_string()));
    }
}
