//! Chunked result-cache behavior at MiB scale: layout, range reads across
//! chunk boundaries, and the guarantee that untouched chunks stay unread.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;

use videogate::background::NoopGate;
use videogate::cache::{CacheKey, GetConditions, StoreRequest, VideoResultCache};
use videogate::config::CacheSettings;
use videogate::response::Body;
use videogate::storage::memory::MemoryKvStore;
use videogate::storage::{KvEntry, KvError, KvListEntry, KvStore};
use videogate::transform::TransformOptions;

const MIB: u64 = 1024 * 1024;

/// KV decorator recording every key read, so tests can assert which chunks
/// were touched.
struct RecordingKv {
    inner: MemoryKvStore,
    reads: Mutex<Vec<String>>,
}

impl RecordingKv {
    fn new() -> Self {
        Self {
            inner: MemoryKvStore::new(),
            reads: Mutex::new(Vec::new()),
        }
    }

    fn reads(&self) -> Vec<String> {
        self.reads.lock().clone()
    }
}

#[async_trait]
impl KvStore for RecordingKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        self.reads.lock().push(key.to_string());
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        metadata: Option<serde_json::Value>,
        expiration_ttl: Option<u64>,
    ) -> Result<(), KvError> {
        self.inner.put(key, value, metadata, expiration_ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvListEntry>, KvError> {
        self.inner.list(prefix).await
    }
}

fn mib_settings() -> CacheSettings {
    CacheSettings {
        single_entry_max_bytes: 2 * MIB,
        chunk_size_bytes: MIB,
        ..Default::default()
    }
}

fn patterned_body(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

fn store_request(key: CacheKey, body: Bytes) -> StoreRequest {
    StoreRequest {
        source_path: "videos/large.mp4".to_string(),
        options: TransformOptions {
            width: Some(1280),
            ..Default::default()
        },
        content_type: "video/mp4".to_string(),
        etag: Some("\"large-etag\"".to_string()),
        cache_tags: vec!["video-large".to_string()],
        ttl_seconds: None,
        cache_version: 1,
        content_length_hint: Some(body.len() as u64),
        body: Body::Full(body),
        key,
    }
}

fn large_key() -> CacheKey {
    CacheKey::from_options(
        "videos/large.mp4",
        &TransformOptions {
            width: Some(1280),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_five_mib_body_becomes_five_chunks_plus_manifest() {
    let kv = Arc::new(RecordingKv::new());
    let cache = VideoResultCache::new(
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::new(NoopGate),
        mib_settings(),
    );
    let body = patterned_body(5 * MIB as usize);
    let key = large_key();

    assert!(cache.store(store_request(key.clone(), body.clone())).await.unwrap());

    let manifest = kv.inner.get(&key.to_string()).await.unwrap().unwrap();
    let metadata = manifest.metadata.unwrap();
    assert_eq!(metadata["isChunked"], true);
    assert_eq!(metadata["chunkCount"], 5);
    assert_eq!(metadata["chunkSize"], MIB);
    assert_eq!(metadata["actualTotalVideoSize"], 5 * MIB);

    let full = cache
        .get(&key, &GetConditions::with_version(1))
        .await
        .unwrap()
        .expect("manifest should hit");
    assert_eq!(full.response.body.collect().await.unwrap(), body);
}

#[tokio::test]
async fn test_range_spanning_chunks_reads_only_intersecting_chunks() {
    let kv = Arc::new(RecordingKv::new());
    let cache = VideoResultCache::new(
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::new(NoopGate),
        mib_settings(),
    );
    let body = patterned_body(5 * MIB as usize);
    let key = large_key();
    cache.store(store_request(key.clone(), body.clone())).await.unwrap();

    // 0.5 MiB spanning the chunk 1 / chunk 2 boundary.
    let start = (MIB + MIB / 2) as usize;
    let end = (2 * MIB + MIB / 4) as usize;
    let header = format!("bytes={}-{}", start, end - 1);

    let hit = cache
        .get(
            &key,
            &GetConditions {
                range: Some(header),
                if_none_match: None,
                cache_version: 1,
            },
        )
        .await
        .unwrap()
        .expect("range should hit");
    assert_eq!(hit.response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        hit.response.header_str("content-length"),
        Some((end - start).to_string().as_str())
    );
    assert_eq!(
        hit.response.header_str("content-range"),
        Some(format!("bytes {}-{}/{}", start, end - 1, 5 * MIB).as_str())
    );
    assert_eq!(
        hit.response.body.collect().await.unwrap(),
        body.slice(start..end)
    );

    let chunk_reads: Vec<String> = kv
        .reads()
        .into_iter()
        .filter(|k| k.contains(":chunk="))
        .collect();
    assert_eq!(
        chunk_reads,
        vec![key.chunk_key(1), key.chunk_key(2)],
        "chunks 0, 3, and 4 must never be read"
    );
}

#[tokio::test]
async fn test_range_entirely_beyond_size_is_416() {
    let kv = Arc::new(RecordingKv::new());
    let cache = VideoResultCache::new(
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::new(NoopGate),
        mib_settings(),
    );
    let key = large_key();
    cache
        .store(store_request(key.clone(), patterned_body(3 * MIB as usize)))
        .await
        .unwrap();

    let hit = cache
        .get(
            &key,
            &GetConditions {
                range: Some(format!("bytes={}-", 10 * MIB)),
                if_none_match: None,
                cache_version: 1,
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hit.response.status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        hit.response.header_str("content-range"),
        Some(format!("bytes */{}", 3 * MIB).as_str())
    );
}

#[tokio::test]
async fn test_suffix_range_on_chunked_entry() {
    let kv = Arc::new(RecordingKv::new());
    let cache = VideoResultCache::new(
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::new(NoopGate),
        mib_settings(),
    );
    let body = patterned_body(3 * MIB as usize);
    let key = large_key();
    cache.store(store_request(key.clone(), body.clone())).await.unwrap();

    let hit = cache
        .get(
            &key,
            &GetConditions {
                range: Some("bytes=-1024".to_string()),
                if_none_match: None,
                cache_version: 1,
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hit.response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        hit.response.body.collect().await.unwrap(),
        body.slice(body.len() - 1024..)
    );
}
