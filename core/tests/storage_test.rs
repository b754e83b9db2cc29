use std::sync::Arc;
use std::time::Duration;

use parley_core::storage::{session_key, InMemoryDurableStore, InMemoryFastStore};
use parley_core::{DurableStore, FastStore, SessionMetadata, SessionStore};

#[tokio::test]
async fn test_durable_list_filters_by_prefix() {
    let store = InMemoryDurableStore::new();
    store.set("session:b", "{}".to_string()).await.unwrap();
    store.set("session:a", "{}".to_string()).await.unwrap();
    store.set("agent:x", "{}".to_string()).await.unwrap();

    let keys = store.list("session:").await.unwrap();
    assert_eq!(keys, vec!["session:a".to_string(), "session:b".to_string()]);
}

#[tokio::test]
async fn test_fast_entries_expire() {
    let fast = InMemoryFastStore::new();
    fast.set("session:a", "1".to_string(), Some(Duration::from_millis(20)))
        .await
        .unwrap();
    fast.set("session:b", "1".to_string(), None).await.unwrap();

    assert!(fast.get("session:a").await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(fast.get("session:a").await.unwrap().is_none());
    assert_eq!(fast.get("session:b").await.unwrap(), Some("1".to_string()));
}

#[tokio::test]
async fn test_metadata_survives_fast_tier_expiry() {
    let durable = InMemoryDurableStore::new();
    let fast = InMemoryFastStore::new();
    let store = SessionStore::new(durable.clone())
        .with_fast_store(fast.clone(), Duration::from_millis(10));

    let mut metadata = SessionMetadata::new("s1");
    metadata.message_count = 3;
    store.save(&metadata).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(fast.get(&session_key("s1")).await.unwrap().is_none());

    let loaded = store.load("s1").await.unwrap().unwrap();
    assert_eq!(loaded, metadata);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_store_without_fast_tier() {
    let store = Arc::new(SessionStore::new(InMemoryDurableStore::new()));
    assert!(store.fast().is_none());

    store.save(&SessionMetadata::new("s1")).await.unwrap();
    store.save(&SessionMetadata::new("s2")).await.unwrap();
    assert_eq!(
        store.list_ids().await.unwrap(),
        vec!["s1".to_string(), "s2".to_string()]
    );

    store.delete("s1").await.unwrap();
    assert!(!store.exists("s1").await.unwrap());
    assert_eq!(store.count().await.unwrap(), 1);
}

#[cfg(feature = "persistent")]
mod rocks {
    use super::*;
    use parley_core::storage::RocksDbDurableStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sessions_survive_restart() {
        let dir = tempdir().unwrap();
        {
            let store = SessionStore::new(RocksDbDurableStore::open(dir.path()).unwrap());
            store.save(&SessionMetadata::new("s1")).await.unwrap();
        }

        let reopened = SessionStore::new(RocksDbDurableStore::open(dir.path()).unwrap());
        assert_eq!(reopened.list_ids().await.unwrap(), vec!["s1".to_string()]);
    }
}
