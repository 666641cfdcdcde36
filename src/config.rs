use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

/// Configuration for Docker-based execution of the built-in `shell` handler.
///
/// When disabled, commands run directly through `sh -c` on the worker host.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Run shell jobs inside a Docker container
    pub enabled: bool,
    /// Docker image to use for job execution
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m"), overridden by a node's `max_memory_mb`
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5"), overridden by a node's `max_cpu_percent`
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Job queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of pending plus in-flight entries
    pub capacity: usize,
    /// Upper bound for `base * 2^attempt` retry backoff
    pub max_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_backoff_ms: 300_000,
        }
    }
}

/// Worker liveness settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub heartbeat_interval_ms: u64,
    /// A worker with no heartbeat for this long is considered dead
    pub heartbeat_timeout_ms: u64,
    pub failover_scan_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            failover_scan_interval_ms: 30_000,
        }
    }
}

impl WorkerPoolConfig {
    /// Registration records outlive the liveness window so the failover scan
    /// can still see who owned a dispatch.
    pub fn record_ttl(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms * 2)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Distributed state store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub lock_ttl_ms: u64,
    /// Retention of executions after they reach a terminal status
    pub terminal_ttl_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 30_000,
            terminal_ttl_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

impl StoreConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn terminal_ttl(&self) -> Duration {
        Duration::from_millis(self.terminal_ttl_ms)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Identity used as lock owner; unique per orchestrator instance
    pub instance_id: String,
    pub reconcile_interval_ms: u64,
    /// How long a cancelled execution's running nodes get to abort
    pub cancellation_grace_ms: u64,
    /// Local retries for lock contention and version conflicts
    pub transient_retry_attempts: u32,
    pub transient_retry_base_ms: u64,
    pub queue: QueueConfig,
    pub pool: WorkerPoolConfig,
    pub store: StoreConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("orchestrator-{}", Uuid::new_v4()),
            reconcile_interval_ms: 10_000,
            cancellation_grace_ms: 30_000,
            transient_retry_attempts: 8,
            transient_retry_base_ms: 20,
            queue: QueueConfig::default(),
            pool: WorkerPoolConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// Configuration of a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub hostname: String,
    pub capabilities: BTreeSet<String>,
    pub max_concurrency: u32,
    pub heartbeat_interval_ms: u64,
    /// Initial delay between polls of an empty queue
    pub poll_interval_ms: u64,
    /// Ceiling for the empty-queue poll backoff
    pub max_poll_backoff_ms: u64,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            hostname: "localhost".to_string(),
            capabilities: BTreeSet::new(),
            max_concurrency: 4,
            heartbeat_interval_ms: 30_000,
            poll_interval_ms: 250,
            max_poll_backoff_ms: 5_000,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }
}

/// Configuration of a server node: API listener, orchestrator instances and
/// an optional in-process worker.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// Number of orchestrator instances sharing this node's store and queue
    pub orchestrator_instances: usize,
    pub orchestrator: OrchestratorConfig,
    pub embedded_worker: Option<WorkerConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            orchestrator_instances: 1,
            orchestrator: OrchestratorConfig::default(),
            embedded_worker: None,
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_embedded_worker(mut self, worker: WorkerConfig) -> Self {
        self.embedded_worker = Some(worker);
        self
    }
}
