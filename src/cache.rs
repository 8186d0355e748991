use async_trait::async_trait;
use dashmap::DashMap;

use crate::types::Upload;

/// Everything `getMetadata` resolves for one upload id: the advisory upload
/// record plus the authoritative multipart binding.
#[derive(Debug, Clone)]
pub struct CachedUpload {
    pub upload: Upload,
    /// S3-assigned multipart UploadId, bound one-to-one with the upload.
    pub multipart_id: String,
    /// tus protocol version recorded when the upload was created.
    pub tus_version: String,
}

/// Key-value cache for resolved upload metadata.
///
/// Purely an optimization: every implementation may drop entries at any time
/// and correctness never depends on a hit. The interface is async so a
/// shared backing (for multi-instance deployments) can stand in for the
/// in-process map.
#[async_trait]
pub trait MetadataCache: Send + Sync {
    async fn get(&self, id: &str) -> Option<CachedUpload>;

    async fn set(&self, id: &str, entry: CachedUpload);

    async fn remove(&self, id: &str);
}

/// In-process metadata cache
#[derive(Default)]
pub struct MemoryMetadataCache {
    entries: DashMap<String, CachedUpload>,
}

impl MemoryMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataCache for MemoryMetadataCache {
    async fn get(&self, id: &str) -> Option<CachedUpload> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    async fn set(&self, id: &str, entry: CachedUpload) {
        self.entries.insert(id.to_string(), entry);
    }

    async fn remove(&self, id: &str) {
        self.entries.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TUS_RESUMABLE;

    fn entry(id: &str) -> CachedUpload {
        CachedUpload {
            upload: Upload::new(id, 42),
            multipart_id: format!("mpu-{id}"),
            tus_version: TUS_RESUMABLE.to_string(),
        }
    }

    #[tokio::test]
    async fn set_then_get_returns_the_entry() {
        let cache = MemoryMetadataCache::new();
        cache.set("up-1", entry("up-1")).await;

        let found = cache.get("up-1").await.unwrap();
        assert_eq!(found.upload.id, "up-1");
        assert_eq!(found.multipart_id, "mpu-up-1");
    }

    #[tokio::test]
    async fn remove_evicts_only_the_named_entry() {
        let cache = MemoryMetadataCache::new();
        cache.set("up-1", entry("up-1")).await;
        cache.set("up-2", entry("up-2")).await;

        cache.remove("up-1").await;

        assert!(cache.get("up-1").await.is_none());
        assert!(cache.get("up-2").await.is_some());
    }

    #[tokio::test]
    async fn missing_entry_is_none() {
        let cache = MemoryMetadataCache::new();
        assert!(cache.get("absent").await.is_none());
    }
}
