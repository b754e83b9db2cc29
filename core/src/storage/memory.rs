//! In-memory storage backends.
//!
//! Use DashMap for concurrent access. Suitable for development and testing; the
//! durable variant does not actually survive a restart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use super::{DurableStore, FastStore};
use crate::Result;

/// In-memory implementation of DurableStore.
#[derive(Default)]
pub struct InMemoryDurableStore {
    entries: DashMap<String, String>,
}

impl InMemoryDurableStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        trace!(key, "Durable set");
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

struct CachedValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory implementation of FastStore.
///
/// Expiry is enforced lazily on read and in bulk by `purge_expired`.
#[derive(Default)]
pub struct InMemoryFastStore {
    entries: DashMap<String, CachedValue>,
}

impl InMemoryFastStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, cached| !cached.is_expired(now));
        before - self.entries.len()
    }
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let value = match self.entries.get(key) {
            Some(cached) if !cached.is_expired(now) => return Ok(Some(cached.value.clone())),
            Some(_) => None,
            None => return Ok(None),
        };
        // Entry exists but is stale; the read guard is released before removal.
        self.entries.remove_if(key, |_, cached| cached.is_expired(now));
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        self.entries
            .insert(key.to_string(), CachedValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_durable_list_by_prefix() {
        let store = InMemoryDurableStore::new();
        store.set("session:a", "1".to_string()).await.unwrap();
        store.set("session:b", "2".to_string()).await.unwrap();
        store.set("other:c", "3".to_string()).await.unwrap();

        let keys = store.list("session:").await.unwrap();
        assert_eq!(keys, vec!["session:a".to_string(), "session:b".to_string()]);

        store.delete("session:a").await.unwrap();
        assert_eq!(store.get("session:a").await.unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_fast_store_expiry() {
        let store = InMemoryFastStore::new();
        store
            .set("session:a", "1".to_string(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        store.set("session:b", "2".to_string(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.get("session:a").await.unwrap(), None);
        assert_eq!(store.get("session:b").await.unwrap(), Some("2".to_string()));
        assert_eq!(store.list("session:").await.unwrap(), vec!["session:b".to_string()]);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryFastStore::new();
        store
            .set("k1", "v".to_string(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        store.set("k2", "v".to_string(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.purge_expired(), 1);
    }
}
