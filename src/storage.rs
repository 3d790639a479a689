//! Storage collaborator for durable records.
//!
//! The runner, ledger, and batch coordinator persist their records through
//! this trait. The contract is deliberately small: single-record atomicity
//! only, with `create` providing the atomic insert-if-absent the ledger's
//! at-most-once guarantee rests on. Durable backends are the host's concern;
//! the in-memory implementation here backs tests, the simulation harness,
//! and embedders that do not need persistence.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key already exists: {0}")]
    AlreadyExists(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Keyed record store with atomic single-record operations.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// Unconditional upsert.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Insert if absent. Returns `AlreadyExists` when the key is taken; the
    /// check and the insert are a single atomic step.
    async fn create(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StorageError>;
}

/// In-memory store over a mutex-guarded ordered map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::copy_from_slice(value));
        Ok(())
    }

    async fn create(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        entries.insert(key.to_string(), Bytes::copy_from_slice(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StorageError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
