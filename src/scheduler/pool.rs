use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WorkerPoolConfig;
use crate::error::{OrchestratorError, Result};
use crate::store::SharedStore;

const WORKER_PREFIX: &str = "worker/";

fn worker_key(worker_id: &str) -> String {
    format!("{WORKER_PREFIX}{worker_id}")
}

/// Registration record of one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub hostname: String,
    pub capabilities: BTreeSet<String>,
    pub max_concurrency: u32,
    pub current_load: u32,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn is_alive(&self, now: DateTime<Utc>, config: &WorkerPoolConfig) -> bool {
        (now - self.last_heartbeat_at).num_milliseconds() < config.heartbeat_timeout_ms as i64
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrency
    }

    pub fn can_run(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// Tracks the worker fleet through the shared store.
///
/// Records expire on their own after `2 × heartbeat_timeout`; liveness is
/// judged on the heartbeat age, so a worker is dead well before its record
/// disappears.
#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<dyn SharedStore>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn SharedStore>, config: WorkerPoolConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Create or refresh a worker's registration.
    pub async fn register(
        &self,
        worker_id: &str,
        hostname: &str,
        capabilities: BTreeSet<String>,
        max_concurrency: u32,
    ) -> Result<WorkerRecord> {
        let now = Utc::now();
        let registered_at = self
            .get(worker_id)
            .await?
            .map(|existing| existing.registered_at)
            .unwrap_or(now);

        let record = WorkerRecord {
            worker_id: worker_id.to_string(),
            hostname: hostname.to_string(),
            capabilities,
            max_concurrency,
            current_load: 0,
            last_heartbeat_at: now,
            registered_at,
        };
        self.store
            .put(
                &worker_key(worker_id),
                serde_json::to_vec(&record)?,
                Some(self.config.record_ttl()),
            )
            .await?;

        tracing::info!(
            worker_id,
            hostname,
            capabilities = ?record.capabilities,
            max_concurrency,
            "Worker registered"
        );
        Ok(record)
    }

    /// Refresh a worker's TTL and load. Unknown workers must register again.
    pub async fn heartbeat(&self, worker_id: &str, current_load: u32) -> Result<WorkerRecord> {
        let key = worker_key(worker_id);
        loop {
            let Some(stored) = self.store.get(&key).await? else {
                return Err(OrchestratorError::WorkerNotFound(worker_id.to_string()));
            };
            let mut record: WorkerRecord = serde_json::from_slice(&stored.value)?;
            record.current_load = current_load;
            record.last_heartbeat_at = Utc::now();

            match self
                .store
                .compare_and_swap(
                    &key,
                    Some(stored.version),
                    serde_json::to_vec(&record)?,
                    Some(self.config.record_ttl()),
                )
                .await
            {
                Ok(_) => {
                    tracing::debug!(worker_id, current_load, "Worker heartbeat");
                    return Ok(record);
                }
                // Raced with another heartbeat or a re-registration; re-read.
                Err(OrchestratorError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn deregister(&self, worker_id: &str) -> Result<bool> {
        let removed = self.store.delete(&worker_key(worker_id)).await?;
        if removed {
            tracing::info!(worker_id, "Worker deregistered");
        }
        Ok(removed)
    }

    pub async fn get(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
        match self.store.get(&worker_key(worker_id)).await? {
            Some(stored) => Ok(Some(serde_json::from_slice(&stored.value)?)),
            None => Ok(None),
        }
    }

    /// Whether the worker has heartbeated within `heartbeat_timeout`.
    pub async fn is_alive(&self, worker_id: &str) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .get(worker_id)
            .await?
            .is_some_and(|record| record.is_alive(now, &self.config)))
    }

    pub async fn all_workers(&self) -> Result<Vec<WorkerRecord>> {
        let mut workers = Vec::new();
        for (key, stored) in self.store.scan_prefix(WORKER_PREFIX).await? {
            match serde_json::from_slice::<WorkerRecord>(&stored.value) {
                Ok(record) => workers.push(record),
                Err(e) => tracing::warn!(key, error = %e, "Skipping unreadable worker record"),
            }
        }
        Ok(workers)
    }

    pub async fn active_workers(&self) -> Result<Vec<WorkerRecord>> {
        let now = Utc::now();
        Ok(self
            .all_workers()
            .await?
            .into_iter()
            .filter(|w| w.is_alive(now, &self.config))
            .collect())
    }

    /// Least-loaded live worker that has every required capability and a
    /// free slot.
    pub async fn select_worker(&self, required: &BTreeSet<String>) -> Result<WorkerRecord> {
        self.active_workers()
            .await?
            .into_iter()
            .filter(|w| w.has_capacity() && w.can_run(required))
            .min_by(|a, b| {
                a.current_load
                    .cmp(&b.current_load)
                    .then_with(|| a.worker_id.cmp(&b.worker_id))
            })
            .ok_or_else(|| OrchestratorError::NoCapableWorker(required.iter().cloned().collect()))
    }
}
