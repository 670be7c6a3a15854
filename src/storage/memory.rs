//! In-memory storage implementations
//!
//! Used by tests and by local development without host bindings. Semantics
//! mirror the host contracts: KV entries honor expiration TTLs at read
//! time, bucket reads support ranges and etag conditions.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use sha2::Digest;

use super::{
    BucketError, BucketGetOutcome, BucketObject, GetOptions, KvEntry, KvError, KvListEntry,
    KvStore, ObjectBucket, ObjectInfo,
};

struct StoredValue {
    value: Bytes,
    metadata: Option<serde_json::Value>,
    expires_at: Option<Instant>,
}

/// In-memory `KvStore` backed by a sorted map so prefix listing is cheap.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, StoredValue>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(stored: &StoredValue) -> bool {
        stored.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        let entries = self.entries.read();
        Ok(entries.get(key).filter(|stored| Self::is_live(stored)).map(|stored| KvEntry {
            value: stored.value.clone(),
            metadata: stored.metadata.clone(),
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        metadata: Option<serde_json::Value>,
        expiration_ttl: Option<u64>,
    ) -> Result<(), KvError> {
        let expires_at = expiration_ttl.map(|secs| Instant::now() + Duration::from_secs(secs));
        self.entries.write().insert(
            key.to_string(),
            StoredValue {
                value,
                metadata,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvListEntry>, KvError> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, stored)| Self::is_live(stored))
            .map(|(key, stored)| KvListEntry {
                key: key.clone(),
                metadata: stored.metadata.clone(),
            })
            .collect())
    }
}

struct StoredObject {
    body: Bytes,
    etag: String,
    content_type: Option<String>,
}

/// In-memory `ObjectBucket`.
#[derive(Default)]
pub struct MemoryBucket {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, body: Bytes, content_type: &str) {
        let etag = format!("\"{}\"", hex::encode(&sha2::Sha256::digest(&body)[..8]));
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                body,
                etag,
                content_type: Some(content_type.to_string()),
            },
        );
    }
}

#[async_trait]
impl ObjectBucket for MemoryBucket {
    async fn get(&self, key: &str, options: GetOptions) -> Result<BucketGetOutcome, BucketError> {
        let objects = self.objects.read();
        let Some(stored) = objects.get(key) else {
            return Ok(BucketGetOutcome::Missing);
        };

        if let Some(if_none_match) = &options.if_none_match {
            if if_none_match == &stored.etag {
                return Ok(BucketGetOutcome::NotModified {
                    etag: stored.etag.clone(),
                });
            }
        }

        let size = stored.body.len() as u64;
        let body = match options.range {
            Some(range) => {
                if range.offset >= size {
                    return Ok(BucketGetOutcome::RangeNotSatisfiable { size });
                }
                let start = range.offset as usize;
                let end = match range.length {
                    Some(length) => (range.offset + length).min(size) as usize,
                    None => size as usize,
                };
                stored.body.slice(start..end)
            }
            None => stored.body.clone(),
        };

        Ok(BucketGetOutcome::Found(BucketObject {
            body,
            etag: stored.etag.clone(),
            content_type: stored.content_type.clone(),
            size,
        }))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, BucketError> {
        let objects = self.objects.read();
        Ok(objects.get(key).map(|stored| ObjectInfo {
            etag: stored.etag.clone(),
            content_type: stored.content_type.clone(),
            size: stored.body.len() as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ObjectRange;

    #[tokio::test]
    async fn test_kv_round_trip_with_metadata() {
        let kv = MemoryKvStore::new();
        kv.put(
            "video:test",
            Bytes::from_static(b"body"),
            Some(serde_json::json!({"contentType": "video/mp4"})),
            None,
        )
        .await
        .unwrap();

        let entry = kv.get("video:test").await.unwrap().expect("entry should exist");
        assert_eq!(entry.value, Bytes::from_static(b"body"));
        assert_eq!(entry.metadata.unwrap()["contentType"], "video/mp4");
    }

    #[tokio::test]
    async fn test_kv_expired_entries_are_invisible() {
        let kv = MemoryKvStore::new();
        kv.put("k", Bytes::from_static(b"v"), None, Some(0)).await.unwrap();
        assert!(kv.get("k").await.unwrap().is_none());
        assert!(kv.list("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kv_list_respects_prefix() {
        let kv = MemoryKvStore::new();
        kv.put("video:a", Bytes::new(), None, None).await.unwrap();
        kv.put("video:a:chunk=0", Bytes::new(), None, None).await.unwrap();
        kv.put("presigned:a", Bytes::new(), None, None).await.unwrap();

        let listed = kv.list("video:a").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|e| e.key.starts_with("video:a")));
    }

    #[tokio::test]
    async fn test_kv_last_writer_wins() {
        let kv = MemoryKvStore::new();
        kv.put("k", Bytes::from_static(b"first"), None, None).await.unwrap();
        kv.put("k", Bytes::from_static(b"second"), None, None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().unwrap().value, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_bucket_range_read_slices_body() {
        let bucket = MemoryBucket::new();
        bucket.insert("clip.mp4", Bytes::from_static(b"0123456789"), "video/mp4");

        let outcome = bucket
            .get(
                "clip.mp4",
                GetOptions {
                    range: Some(ObjectRange { offset: 2, length: Some(3) }),
                    if_none_match: None,
                },
            )
            .await
            .unwrap();

        match outcome {
            BucketGetOutcome::Found(object) => {
                assert_eq!(object.body, Bytes::from_static(b"234"));
                assert_eq!(object.size, 10, "size reports the full object");
            }
            other => panic!("expected Found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bucket_range_beyond_size_is_unsatisfiable() {
        let bucket = MemoryBucket::new();
        bucket.insert("clip.mp4", Bytes::from_static(b"0123"), "video/mp4");

        let outcome = bucket
            .get(
                "clip.mp4",
                GetOptions {
                    range: Some(ObjectRange { offset: 100, length: None }),
                    if_none_match: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, BucketGetOutcome::RangeNotSatisfiable { size: 4 }));
    }

    #[tokio::test]
    async fn test_bucket_conditional_hit_returns_not_modified() {
        let bucket = MemoryBucket::new();
        bucket.insert("clip.mp4", Bytes::from_static(b"data"), "video/mp4");
        let info = bucket.head("clip.mp4").await.unwrap().unwrap();

        let outcome = bucket
            .get(
                "clip.mp4",
                GetOptions {
                    range: None,
                    if_none_match: Some(info.etag.clone()),
                },
            )
            .await
            .unwrap();
        match outcome {
            BucketGetOutcome::NotModified { etag } => assert_eq!(etag, info.etag),
            other => panic!("expected NotModified, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bucket_missing_object() {
        let bucket = MemoryBucket::new();
        assert!(matches!(
            bucket.get("absent", GetOptions::default()).await.unwrap(),
            BucketGetOutcome::Missing
        ));
        assert!(bucket.head("absent").await.unwrap().is_none());
    }
}
