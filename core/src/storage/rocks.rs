//! Persistent RocksDB-based durable store.
//!
//! Keys are stored as UTF-8 bytes in a dedicated column family so that prefix
//! listing is a single forward scan from the prefix.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use tracing::{debug, info};

use super::DurableStore;
use crate::{ParleyError, Result};

/// Column family holding session metadata
const CF_SESSIONS: &str = "sessions";

/// Persistent RocksDB-based implementation of DurableStore.
pub struct RocksDbDurableStore {
    db: DB,
}

impl RocksDbDurableStore {
    /// Open (or create) a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = vec![ColumnFamilyDescriptor::new(CF_SESSIONS, Options::default())];

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| ParleyError::Storage(e.to_string()))?;

        info!("RocksDbDurableStore initialized");
        Ok(Arc::new(Self { db }))
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_SESSIONS)
            .ok_or_else(|| ParleyError::Storage(format!("Missing CF: {}", CF_SESSIONS)))
    }
}

#[async_trait]
impl DurableStore for RocksDbDurableStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, key) {
            Ok(Some(data)) => String::from_utf8(data)
                .map(Some)
                .map_err(|e| ParleyError::Storage(e.to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(ParleyError::Storage(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let cf = self.cf()?;
        self.db
            .put_cf(cf, key, value.as_bytes())
            .map_err(|e| ParleyError::Storage(e.to_string()))?;
        debug!(key, "Stored durable record");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let cf = self.cf()?;
        self.db
            .delete_cf(cf, key)
            .map_err(|e| ParleyError::Storage(e.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let cf = self.cf()?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut keys = Vec::new();
        for entry in iter {
            let (key, _) = entry.map_err(|e| ParleyError::Storage(e.to_string()))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            keys.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(keys)
    }
}
