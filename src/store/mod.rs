//! Shared ephemeral store and the distributed state built on top of it.
//!
//! All cross-instance coordination goes through a [`SharedStore`]: worker
//! registrations, execution locks, execution state and dispatch tokens.
//! Nothing authoritative lives only in an orchestrator's memory, which is
//! what lets another instance pick up an execution after a crash.
//!
//! # Components
//!
//! - [`SharedStore`]: key/value contract with TTLs, versions and atomic
//!   compare-and-set operations
//! - [`MemoryStore`]: in-process implementation
//! - [`StateStore`]: distributed locks, versioned execution state and the
//!   dispatch token index

pub mod memory;
pub mod state;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStore;
pub use state::{DispatchRef, LockGuard, StateStore};

/// A stored value together with the version assigned by its last write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Contract of the shared store. Every method is atomic with respect to the
/// others, and expired keys are invisible to all of them.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<bool>;

    /// Write only if the current version equals `expected_version`
    /// (`None` = key must be absent). Fails with `VersionConflict` otherwise.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<u64>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete only if the current value equals `expected`.
    async fn delete_if_value(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Reset the TTL only if the current value equals `expected`.
    async fn expire_if_value(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool>;

    /// All live keys starting with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;
}
