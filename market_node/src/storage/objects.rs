//! Object storage for uploaded files (avatars).
//!
//! Objects live under `{bucket}/{path}` and are served back through
//! `GET /storage/{bucket}/{path}`; `public_url` builds that address.

use super::{Result, StorageError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, path: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<()>;
    async fn get(&self, bucket: &str, path: &str) -> Result<Option<StoredObject>>;
    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Reject empty segments, `..` and absolute paths
pub fn sanitize_object_path(bucket: &str, path: &str) -> Result<PathBuf> {
    if bucket.is_empty() || bucket.contains('/') || bucket.contains("..") {
        return Err(StorageError::InvalidData(format!("invalid bucket: {bucket}")));
    }
    let candidate = Path::new(path);
    if path.is_empty()
        || !candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidData(format!("invalid object path: {path}")));
    }
    Ok(Path::new(bucket).join(candidate))
}

pub fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn join_url(base_url: &str, bucket: &str, path: &str) -> String {
    format!("{}/storage/{}/{}", base_url.trim_end_matches('/'), bucket, path)
}

pub struct MemoryObjectStore {
    base_url: String,
    objects: RwLock<HashMap<PathBuf, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let key = sanitize_object_path(bucket, path)?;
        self.objects.write().insert(
            key,
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> Result<Option<StoredObject>> {
        let key = sanitize_object_path(bucket, path)?;
        Ok(self.objects.read().get(&key).cloned())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        join_url(&self.base_url, bucket, path)
    }
}

/// Files under a root directory; the content type is derived from the extension
pub struct FsObjectStore {
    root: PathBuf,
    base_url: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<()> {
        let target = self.root.join(sanitize_object_path(bucket, path)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::WriteError(e.to_string()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| StorageError::WriteError(e.to_string()))
    }

    async fn get(&self, bucket: &str, path: &str) -> Result<Option<StoredObject>> {
        let target = self.root.join(sanitize_object_path(bucket, path)?);
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(StoredObject {
                bytes,
                content_type: content_type_for(path).to_string(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::ReadError(e.to_string())),
        }
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        join_url(&self.base_url, bucket, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_is_rejected() {
        assert!(sanitize_object_path("avatars", "../secret").is_err());
        assert!(sanitize_object_path("avatars", "/etc/passwd").is_err());
        assert!(sanitize_object_path("../x", "a.png").is_err());
        assert!(sanitize_object_path("avatars", "user/a.png").is_ok());
    }

    #[tokio::test]
    async fn fs_store_round_trips_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path(), "http://localhost:3000/");
        store
            .put("avatars", "u1/0.42.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();

        let object = store.get("avatars", "u1/0.42.png").await.unwrap().unwrap();
        assert_eq!(object.bytes, vec![1, 2, 3]);
        assert_eq!(object.content_type, "image/png");
        assert!(store.get("avatars", "u1/missing.png").await.unwrap().is_none());
        assert_eq!(
            store.public_url("avatars", "u1/0.42.png"),
            "http://localhost:3000/storage/avatars/u1/0.42.png"
        );
    }
}
