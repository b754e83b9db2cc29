//! Storage ports for session metadata.
//!
//! Two key/value capabilities are consumed by the session manager:
//! - `DurableStore` - authoritative, survives restarts
//! - `FastStore` - ephemeral accelerator, entries may carry their own expiry
//!
//! Implementations:
//! - `InMemoryDurableStore` / `InMemoryFastStore` - development and testing
//! - `RocksDbDurableStore` - production persistence (feature `persistent`)
//!
//! `SessionStore` layers the session key scheme and dual-tier writes on top.

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

pub mod memory;
#[cfg(feature = "persistent")]
pub mod rocks;
pub mod tiered;

pub use memory::{InMemoryDurableStore, InMemoryFastStore};
#[cfg(feature = "persistent")]
pub use rocks::RocksDbDurableStore;
pub use tiered::SessionStore;

/// Key prefix for session metadata records
pub const SESSION_KEY_PREFIX: &str = "session:";

/// Storage key for a session id (`session:<id>`)
pub fn session_key(id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{id}")
}

/// Session id from a storage key, if the key is a session key
pub fn session_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(SESSION_KEY_PREFIX)
}

/// Authoritative key/value store
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Non-authoritative cache; `ttl` is an expiry hint
#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_roundtrip() {
        let key = session_key("abc");
        assert_eq!(key, "session:abc");
        assert_eq!(session_id_from_key(&key), Some("abc"));
        assert_eq!(session_id_from_key("other:abc"), None);
    }
}
