//! Dual-tier session metadata persistence.
//!
//! The durable tier is the single source of truth: every read and existence check
//! goes there. The fast tier is written alongside it as an accelerator and its
//! failures are logged, never propagated.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{session_id_from_key, session_key, DurableStore, FastStore, SESSION_KEY_PREFIX};
use crate::session::SessionMetadata;
use crate::Result;

/// Session metadata persistence over a durable store and an optional fast store.
pub struct SessionStore {
    durable: Arc<dyn DurableStore>,
    fast: Option<Arc<dyn FastStore>>,
    fast_ttl: Option<Duration>,
}

impl SessionStore {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self {
            durable,
            fast: None,
            fast_ttl: None,
        }
    }

    /// Attach a fast tier whose entries expire after `ttl`
    pub fn with_fast_store(mut self, fast: Arc<dyn FastStore>, ttl: Duration) -> Self {
        self.fast = Some(fast);
        self.fast_ttl = Some(ttl);
        self
    }

    /// Write metadata to the durable tier, then mirror it into the fast tier.
    pub async fn save(&self, metadata: &SessionMetadata) -> Result<()> {
        let key = session_key(&metadata.id);
        let value = serde_json::to_string(metadata)?;

        self.durable.set(&key, value.clone()).await?;

        if let Some(fast) = &self.fast {
            if let Err(e) = fast.set(&key, value, self.fast_ttl).await {
                warn!(session_id = %metadata.id, error = %e, "Fast store write failed");
            }
        }

        debug!(session_id = %metadata.id, "Saved session metadata");
        Ok(())
    }

    /// Read metadata from the durable tier
    pub async fn load(&self, id: &str) -> Result<Option<SessionMetadata>> {
        match self.durable.get(&session_key(id)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.durable.get(&session_key(id)).await?.is_some())
    }

    /// Delete from both tiers. A durable failure is returned after the fast tier
    /// has been attempted.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let key = session_key(id);
        let durable = self.durable.delete(&key).await;

        if let Some(fast) = &self.fast {
            if let Err(e) = fast.delete(&key).await {
                warn!(session_id = %id, error = %e, "Fast store delete failed");
            }
        }

        durable
    }

    /// All durably recorded session ids
    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let keys = self.durable.list(SESSION_KEY_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|key| session_id_from_key(key))
            .map(str::to_string)
            .collect())
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.durable.list(SESSION_KEY_PREFIX).await?.len())
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub fn fast(&self) -> Option<&Arc<dyn FastStore>> {
        self.fast.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryDurableStore, InMemoryFastStore};
    use crate::ParleyError;
    use async_trait::async_trait;

    struct BrokenFastStore;

    #[async_trait]
    impl FastStore for BrokenFastStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(ParleyError::Storage("down".to_string()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> Result<()> {
            Err(ParleyError::Storage("down".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(ParleyError::Storage("down".to_string()))
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
            Err(ParleyError::Storage("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_save_writes_both_tiers() {
        let durable = InMemoryDurableStore::new();
        let fast = InMemoryFastStore::new();
        let store = SessionStore::new(durable.clone())
            .with_fast_store(fast.clone(), Duration::from_secs(60));

        store.save(&SessionMetadata::new("s1")).await.unwrap();

        assert!(durable.get("session:s1").await.unwrap().is_some());
        assert!(fast.get("session:s1").await.unwrap().is_some());
        assert_eq!(store.list_ids().await.unwrap(), vec!["s1".to_string()]);

        store.delete("s1").await.unwrap();
        assert!(durable.get("session:s1").await.unwrap().is_none());
        assert!(fast.get("session:s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fast_tier_failure_is_not_fatal() {
        let durable = InMemoryDurableStore::new();
        let store = SessionStore::new(durable.clone())
            .with_fast_store(Arc::new(BrokenFastStore), Duration::from_secs(60));

        store.save(&SessionMetadata::new("s1")).await.unwrap();
        assert!(store.exists("s1").await.unwrap());

        store.delete("s1").await.unwrap();
        assert!(!store.exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_fast_tier_is_not_consulted_for_existence() {
        let durable = InMemoryDurableStore::new();
        let fast = InMemoryFastStore::new();
        let store = SessionStore::new(durable.clone())
            .with_fast_store(fast.clone(), Duration::from_secs(60));

        // Stale accelerator entry with no durable record
        fast.set("session:ghost", "{}".to_string(), None).await.unwrap();

        assert!(!store.exists("ghost").await.unwrap());
        assert!(store.load("ghost").await.unwrap().is_none());
    }
}
