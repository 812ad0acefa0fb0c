//! RocksDB-backed storage, enabled with the `rocksdb` feature

use super::{BatchOp, Result, Storage, StorageError, StorageStats};
use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct RocksDbStorage {
    db: Arc<DB>,
    path: PathBuf,
}

impl RocksDbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        log::info!("Opened RocksDB store at {}", path.as_ref().display());
        Ok(Self {
            db: Arc::new(db),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Storage for RocksDbStorage {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| StorageError::ReadError(e.to_string()))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put(key, value)
            .map_err(|e| StorageError::WriteError(e.to_string()))
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.db
            .delete(key)
            .map_err(|e| StorageError::WriteError(e.to_string()))
    }

    async fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| StorageError::ReadError(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => batch.put(k, v),
                BatchOp::Delete(k) => batch.delete(k),
            }
        }
        self.db
            .write(batch)
            .map_err(|e| StorageError::WriteError(e.to_string()))
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let num_entries = self
            .db
            .property_int_value("rocksdb.estimate-num-keys")
            .map_err(|e| StorageError::ReadError(e.to_string()))?
            .unwrap_or(0);
        let total_size = self
            .db
            .property_int_value("rocksdb.total-sst-files-size")
            .map_err(|e| StorageError::ReadError(e.to_string()))?
            .unwrap_or(0);
        Ok(StorageStats {
            total_size,
            num_entries,
            ..Default::default()
        })
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| StorageError::WriteError(e.to_string()))
    }
}
