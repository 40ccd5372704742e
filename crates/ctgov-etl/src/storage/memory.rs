//! In-process object store

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{calculate_sha256, ObjectStore, UploadResult};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
struct Blob {
    data: Vec<u8>,
    content_type: String,
}

/// [`ObjectStore`] over a sorted map. Reports every object as encrypted.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Blob>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|blob| blob.content_type.clone())
    }

    /// Overwrite an object without going through `put`
    pub async fn insert(&self, key: impl Into<String>, data: Vec<u8>) {
        self.objects.write().await.insert(
            key.into(),
            Blob {
                data,
                content_type: "application/octet-stream".to_string(),
            },
        );
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<UploadResult> {
        let result = UploadResult {
            key: key.to_string(),
            checksum: calculate_sha256(&data),
            size: data.len() as u64,
            encrypted: true,
        };
        self.objects.write().await.insert(
            key.to_string(),
            Blob {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(result)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|blob| blob.data.clone())
            .ok_or_else(|| PipelineError::storage_read(key, "no such key"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let store = InMemoryObjectStore::new();
        let uploaded = store.put("a/2", b"two".to_vec(), "text/plain").await.unwrap();
        store.put("a/1", b"one".to_vec(), "text/plain").await.unwrap();
        store.put("b/1", b"other".to_vec(), "text/plain").await.unwrap();

        assert_eq!(uploaded.size, 3);
        assert!(uploaded.encrypted);
        assert_eq!(store.get("a/2").await.unwrap(), b"two".to_vec());
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/1", "a/2"]);
        assert!(store.exists("b/1").await.unwrap());
        assert!(!store.exists("b/2").await.unwrap());
        assert_eq!(store.content_type("a/1").await.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_missing_key_is_read_error() {
        let store = InMemoryObjectStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, PipelineError::StorageReadFailed { .. }));
    }
}
