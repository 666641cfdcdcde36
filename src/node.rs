use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::NodeConfig;
use crate::orchestrator::Orchestrator;
use crate::scheduler::JobQueue;
use crate::store::{MemoryStore, SharedStore};
use crate::worker::{JobExecutor, LocalControlPlane, WorkerRuntime};

/// A server process: the shared store, the job queue, one or more
/// orchestrator instances, the HTTP API and optionally an embedded worker.
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<dyn SharedStore>,
    pub job_queue: Arc<RwLock<JobQueue>>,
    pub orchestrators: Vec<Arc<Orchestrator>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        Self::with_store(config, store)
    }

    /// Build a node on top of an existing store backend.
    pub fn with_store(config: NodeConfig, store: Arc<dyn SharedStore>) -> Self {
        let job_queue = Arc::new(RwLock::new(JobQueue::new(&config.orchestrator.queue)));
        let instances = config.orchestrator_instances.max(1);
        let orchestrators = (0..instances)
            .map(|i| {
                let orchestrator_config = if instances == 1 {
                    config.orchestrator.clone()
                } else {
                    let base = config.orchestrator.instance_id.clone();
                    config
                        .orchestrator
                        .clone()
                        .with_instance_id(format!("{base}-{i}"))
                };
                Arc::new(Orchestrator::new(
                    orchestrator_config,
                    store.clone(),
                    job_queue.clone(),
                ))
            })
            .collect();

        Self {
            config,
            store,
            job_queue,
            orchestrators,
        }
    }

    /// Orchestrator instance serving the API.
    pub fn primary(&self) -> Arc<Orchestrator> {
        self.orchestrators[0].clone()
    }

    /// Run the node with all components.
    ///
    /// 1. Spawns a reconciliation loop and a failover loop per orchestrator
    ///    instance
    /// 2. Optionally spawns the embedded worker
    /// 3. Runs the HTTP API until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns an error if the API listener cannot be bound or fails.
    /// Background loops log their own errors.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        for orchestrator in &self.orchestrators {
            tracing::info!(instance_id = %orchestrator.instance_id(), "Starting orchestrator instance");
            tokio::spawn(
                orchestrator
                    .clone()
                    .run_reconciliation_loop(shutdown.clone()),
            );
            tokio::spawn(orchestrator.clone().run_failover_loop(shutdown.clone()));
        }

        let worker_task = self.config.embedded_worker.clone().map(|worker_config| {
            let control = Arc::new(LocalControlPlane::new(self.primary()));
            let executor = JobExecutor::with_sandbox(worker_config.sandbox.clone());
            let runtime = WorkerRuntime::new(worker_config, control, executor);
            let worker_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = runtime.run(worker_shutdown).await {
                    tracing::error!(error = %e, "Embedded worker failed");
                }
            })
        });

        let state = ApiState {
            orchestrator: self.primary(),
        };
        run_api(self.config.listen_addr, state, shutdown).await?;

        if let Some(task) = worker_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Embedded worker task failed");
            }
        }
        tracing::info!("Node stopped");
        Ok(())
    }
}
