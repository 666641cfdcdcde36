use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::store::{SharedStore, Versioned};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }

    fn versioned(&self) -> Versioned {
        Versioned {
            value: self.value.clone(),
            version: self.version,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    /// Global so a deleted-then-recreated key never reuses a version
    next_version: u64,
}

impl Inner {
    fn live(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        let expired = self.entries.get(key).is_some_and(|e| !e.is_live(now));
        if expired {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn write(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>, now: Instant) -> u64 {
        self.next_version += 1;
        let version = self.next_version;
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        version
    }
}

/// In-process [`SharedStore`]. Expiry is evaluated lazily on access, so a
/// key is gone the instant its TTL elapses even if nobody touches it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner.entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner.live(key, now).map(Entry::versioned))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner.write(key, value, ttl, now))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.live(key, now).is_some() {
            return Ok(false);
        }
        inner.write(key, value, ttl, now);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let found = inner.live(key, now).map(|e| e.version);
        if found != expected_version {
            return Err(OrchestratorError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                found,
            });
        }
        Ok(inner.write(key, value, ttl, now))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let existed = inner.live(key, now).is_some();
        inner.entries.remove(key);
        Ok(existed)
    }

    async fn delete_if_value(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let matches = inner.live(key, now).is_some_and(|e| e.value == expected);
        if matches {
            inner.entries.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_value(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let matches = inner.live(key, now).is_some_and(|e| e.value == expected);
        if !matches {
            return Ok(false);
        }
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(true)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.entries.retain(|_, e| e.is_live(now));
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.versioned()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_get_bump_versions() {
        let store = MemoryStore::new();
        let v1 = store.put("a", b"1".to_vec(), None).await.unwrap();
        let v2 = store.put("a", b"2".to_vec(), None).await.unwrap();
        assert!(v2 > v1);
        let got = store.get("a").await.unwrap().unwrap();
        assert_eq!(got.value, b"2");
        assert_eq!(got.version, v2);
    }

    #[tokio::test]
    async fn set_if_absent_only_writes_once() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", b"x".to_vec(), None).await.unwrap());
        assert!(!store.set_if_absent("k", b"y".to_vec(), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"x");
    }

    #[tokio::test]
    async fn expired_keys_are_invisible() {
        let store = MemoryStore::new();
        store
            .put("ttl", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("ttl").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("ttl").await.unwrap().is_none());
        assert!(store
            .set_if_absent("ttl", b"w".to_vec(), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_version() {
        let store = MemoryStore::new();
        let v1 = store
            .compare_and_swap("doc", None, b"1".to_vec(), None)
            .await
            .unwrap();
        let v2 = store
            .compare_and_swap("doc", Some(v1), b"2".to_vec(), None)
            .await
            .unwrap();

        let err = store
            .compare_and_swap("doc", Some(v1), b"3".to_vec(), None)
            .await
            .unwrap_err();
        match err {
            OrchestratorError::VersionConflict {
                expected, found, ..
            } => {
                assert_eq!(expected, Some(v1));
                assert_eq!(found, Some(v2));
            }
            other => panic!("unexpected error: {other}"),
        }

        // Creating over an existing key is also a conflict
        assert!(store
            .compare_and_swap("doc", None, b"4".to_vec(), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delete_and_expire_if_value() {
        let store = MemoryStore::new();
        store.put("lock", b"owner-a".to_vec(), None).await.unwrap();

        assert!(!store.delete_if_value("lock", b"owner-b").await.unwrap());
        assert!(!store
            .expire_if_value("lock", b"owner-b", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(store
            .expire_if_value("lock", b"owner-a", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(store.delete_if_value("lock", b"owner-a").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store.put("worker/b", b"2".to_vec(), None).await.unwrap();
        store.put("worker/a", b"1".to_vec(), None).await.unwrap();
        store.put("workers", b"x".to_vec(), None).await.unwrap();
        store.put("lock/a", b"l".to_vec(), None).await.unwrap();

        let keys: Vec<String> = store
            .scan_prefix("worker/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["worker/a".to_string(), "worker/b".to_string()]);
        assert_eq!(store.len().await, 4);
    }
}
