//! Cache version counter
//!
//! A monotonic integer, scoped by source path, used to invalidate a whole
//! slice of the result cache without iterating keys. Entries written under
//! an older version read as misses; the transform URL carries `?v=<n>` for
//! versions above 1 so the CDN tier re-fetches as well.

use std::sync::Arc;

use bytes::Bytes;

use crate::storage::KvStore;

const VERSION_KEY_PREFIX: &str = "version";

pub struct CacheVersionStore {
    kv: Arc<dyn KvStore>,
}

impl CacheVersionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key_for(source_path: &str) -> String {
        format!("{}:{}", VERSION_KEY_PREFIX, super::key::normalize_path(source_path))
    }

    /// Current version for a path; 1 when none was ever written or the
    /// stored value is unreadable.
    pub async fn current(&self, source_path: &str) -> u32 {
        let key = Self::key_for(source_path);
        match self.kv.get(&key).await {
            Ok(Some(entry)) => std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(1),
            Ok(None) => 1,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "version read failed, assuming 1");
                1
            }
        }
    }

    /// Bump the version for a path, returning the new value.
    pub async fn bump(&self, source_path: &str) -> Result<u32, crate::storage::KvError> {
        let next = self.current(source_path).await + 1;
        let key = Self::key_for(source_path);
        self.kv
            .put(&key, Bytes::from(next.to_string()), None, None)
            .await?;
        tracing::info!(path = %source_path, version = next, "cache version bumped");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryKvStore;

    #[tokio::test]
    async fn test_unset_version_defaults_to_one() {
        let store = CacheVersionStore::new(Arc::new(MemoryKvStore::new()));
        assert_eq!(store.current("/videos/test.mp4").await, 1);
    }

    #[tokio::test]
    async fn test_bump_increments_monotonically() {
        let store = CacheVersionStore::new(Arc::new(MemoryKvStore::new()));
        assert_eq!(store.bump("/videos/test.mp4").await.unwrap(), 2);
        assert_eq!(store.bump("/videos/test.mp4").await.unwrap(), 3);
        assert_eq!(store.current("/videos/test.mp4").await, 3);
    }

    #[tokio::test]
    async fn test_versions_are_path_scoped() {
        let store = CacheVersionStore::new(Arc::new(MemoryKvStore::new()));
        store.bump("/videos/a.mp4").await.unwrap();
        assert_eq!(store.current("/videos/a.mp4").await, 2);
        assert_eq!(store.current("/videos/b.mp4").await, 1);
    }

    #[tokio::test]
    async fn test_garbage_value_reads_as_one() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put("version:videos/test.mp4", Bytes::from_static(b"not-a-number"), None, None)
            .await
            .unwrap();
        let store = CacheVersionStore::new(kv);
        assert_eq!(store.current("videos/test.mp4").await, 1);
    }
}
