use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod market_store;
pub mod memory;
pub mod objects;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;

pub use market_store::{MarketStore, OrderChange};
pub use memory::MemoryStorage;
pub use objects::{FsObjectStore, MemoryObjectStore, ObjectStore, StoredObject};
#[cfg(feature = "rocksdb")]
pub use self::rocksdb::RocksDbStorage;

// Storage-specific Result type
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Write error: {0}")]
    WriteError(String),
    #[error("Read error: {0}")]
    ReadError(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidData(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_size: u64,
    pub num_entries: u64,
    pub read_operations: u64,
    pub write_operations: u64,
}

/// One step of an atomic batch write
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Key/value backend shared by every record type of the node
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
    async fn exists(&self, key: &[u8]) -> Result<bool>;

    /// All entries whose key starts with `prefix`, in key order
    async fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every operation or none of them
    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    async fn get_stats(&self) -> Result<StorageStats>;
    async fn flush(&self) -> Result<()>;

    async fn list_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.scan(prefix).await?.into_iter().map(|(k, _)| k).collect())
    }
}
