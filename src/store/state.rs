use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::execution::Execution;
use crate::store::SharedStore;

const LOCK_PREFIX: &str = "lock/";
const EXECUTION_PREFIX: &str = "execution/";
const DISPATCH_PREFIX: &str = "dispatch/";

fn lock_key(resource: &str) -> String {
    format!("{LOCK_PREFIX}{resource}")
}

fn execution_key(execution_id: Uuid) -> String {
    format!("{EXECUTION_PREFIX}{execution_id}")
}

fn dispatch_key(token: Uuid) -> String {
    format!("{DISPATCH_PREFIX}{token}")
}

/// Lock resource name guarding one execution.
pub fn execution_resource(execution_id: Uuid) -> String {
    format!("execution:{execution_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockValue {
    owner: String,
    token: Uuid,
}

/// Proof of holding a lock. Only the token can release or renew it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub resource: String,
    pub owner: String,
    pub token: Uuid,
}

/// Where a dispatch token points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRef {
    pub execution_id: Uuid,
    pub node_id: String,
}

/// Distributed locks plus versioned execution state, both kept in the
/// shared store.
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn SharedStore>,
    config: StoreConfig,
}

impl StateStore {
    pub fn new(store: Arc<dyn SharedStore>, config: StoreConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Atomically take `resource`. Fails fast with `LockHeld` while anyone
    /// else (or another tick of the same owner) holds it.
    pub async fn acquire_lock(&self, resource: &str, owner: &str, ttl: Duration) -> Result<LockGuard> {
        let value = LockValue {
            owner: owner.to_string(),
            token: Uuid::new_v4(),
        };
        let key = lock_key(resource);
        if self
            .store
            .set_if_absent(&key, serde_json::to_vec(&value)?, Some(ttl))
            .await?
        {
            tracing::debug!(resource, owner, "Lock acquired");
            return Ok(LockGuard {
                resource: resource.to_string(),
                owner: value.owner,
                token: value.token,
            });
        }

        let holder = self
            .read_lock(&key)
            .await?
            .map(|(v, _)| v.owner)
            .unwrap_or_else(|| "unknown".to_string());
        Err(OrchestratorError::LockHeld {
            resource: resource.to_string(),
            holder,
        })
    }

    /// Release `resource` if `token` still holds it. A lock that expired and
    /// was taken by someone else is left alone.
    pub async fn release_lock(&self, resource: &str, token: Uuid) -> Result<bool> {
        let key = lock_key(resource);
        match self.read_lock(&key).await? {
            Some((value, raw)) if value.token == token => {
                let released = self.store.delete_if_value(&key, &raw).await?;
                if released {
                    tracing::debug!(resource, "Lock released");
                }
                Ok(released)
            }
            _ => Ok(false),
        }
    }

    /// Extend the TTL of a lock still held by `token`.
    pub async fn renew_lock(&self, resource: &str, token: Uuid, ttl: Duration) -> Result<bool> {
        let key = lock_key(resource);
        match self.read_lock(&key).await? {
            Some((value, raw)) if value.token == token => {
                self.store.expire_if_value(&key, &raw, ttl).await
            }
            _ => Ok(false),
        }
    }

    pub async fn lock_holder(&self, resource: &str) -> Result<Option<String>> {
        Ok(self.read_lock(&lock_key(resource)).await?.map(|(v, _)| v.owner))
    }

    async fn read_lock(&self, key: &str) -> Result<Option<(LockValue, Vec<u8>)>> {
        match self.store.get(key).await? {
            Some(stored) => {
                let value: LockValue = serde_json::from_slice(&stored.value)?;
                Ok(Some((value, stored.value)))
            }
            None => Ok(None),
        }
    }

    /// Current state and its version.
    pub async fn get_execution_state(&self, execution_id: Uuid) -> Result<Option<(Execution, u64)>> {
        match self.store.get(&execution_key(execution_id)).await? {
            Some(stored) => Ok(Some((serde_json::from_slice(&stored.value)?, stored.version))),
            None => Ok(None),
        }
    }

    /// Optimistic write: `expected_version` is the version last read
    /// (`None` to create). A stale write fails with `VersionConflict`.
    /// Terminal executions are retained for the terminal TTL only.
    pub async fn put_execution_state(
        &self,
        execution: &Execution,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let ttl = execution
            .status
            .is_terminal()
            .then(|| self.config.terminal_ttl());
        self.store
            .compare_and_swap(
                &execution_key(execution.execution_id),
                expected_version,
                serde_json::to_vec(execution)?,
                ttl,
            )
            .await
    }

    pub async fn list_executions(&self) -> Result<Vec<(Execution, u64)>> {
        let mut executions = Vec::new();
        for (key, stored) in self.store.scan_prefix(EXECUTION_PREFIX).await? {
            match serde_json::from_slice::<Execution>(&stored.value) {
                Ok(execution) => executions.push((execution, stored.version)),
                Err(e) => tracing::warn!(key, error = %e, "Skipping unreadable execution"),
            }
        }
        Ok(executions)
    }

    pub async fn put_dispatch(&self, token: Uuid, dispatch: &DispatchRef) -> Result<()> {
        self.store
            .put(&dispatch_key(token), serde_json::to_vec(dispatch)?, None)
            .await?;
        Ok(())
    }

    pub async fn get_dispatch(&self, token: Uuid) -> Result<Option<DispatchRef>> {
        match self.store.get(&dispatch_key(token)).await? {
            Some(stored) => Ok(Some(serde_json::from_slice(&stored.value)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_dispatch(&self, token: Uuid) -> Result<()> {
        self.store.delete(&dispatch_key(token)).await?;
        Ok(())
    }
}
