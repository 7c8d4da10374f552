use super::{BlobStore, StoredBlob};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory blob store for tests and local harnesses.
#[derive(Clone)]
pub struct MockBlobStore {
    blobs: Arc<Mutex<HashMap<String, StoredBlob>>>,
    base_url: Option<String>,
    store_count: Arc<Mutex<usize>>,
    remove_count: Arc<Mutex<usize>>,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(Mutex::new(HashMap::new())),
            base_url: None,
            store_count: Arc::new(Mutex::new(0)),
            remove_count: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn get_store_count(&self) -> usize {
        *self.store_count.lock()
    }

    pub fn get_remove_count(&self) -> usize {
        *self.remove_count.lock()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MockBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn store(&self, key: &str, data: &[u8], content_type: &str) -> Result<Option<String>> {
        *self.store_count.lock() += 1;

        self.blobs.lock().insert(
            key.to_string(),
            StoredBlob {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(self
            .base_url
            .as_ref()
            .map(|base| format!("{}/files/{}", base, key)))
    }

    async fn fetch(&self, key: &str) -> Result<Option<StoredBlob>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        *self.remove_count.lock() += 1;
        self.blobs.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_store_and_fetch() {
        let store = MockBlobStore::new().with_base_url("https://test-proxy.com".to_string());

        let url = store.store("a.png", b"png", "image/png").await.unwrap();
        assert_eq!(url.as_deref(), Some("https://test-proxy.com/files/a.png"));
        assert_eq!(store.get_store_count(), 1);

        let blob = store.fetch("a.png").await.unwrap().unwrap();
        assert_eq!(blob.content_type, "image/png");
    }

    #[tokio::test]
    async fn test_mock_remove() {
        let store = MockBlobStore::new();
        store.store("a.png", b"png", "image/png").await.unwrap();

        store.remove("a.png").await.unwrap();
        assert!(!store.contains("a.png"));
        assert_eq!(store.get_remove_count(), 1);
        assert!(store.fetch("a.png").await.unwrap().is_none());
    }
}
