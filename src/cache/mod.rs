//! KV result cache
//!
//! Transformed artifacts are stored content-addressed: the key encodes the
//! source path and the transformation options. Bodies at or below the
//! single-entry threshold live in one KV value; larger bodies are split
//! into fixed-size chunks with a manifest written last, so readers never
//! observe a partial entry. TTLs come from the caller or the configured
//! path profiles; cache-version bumps invalidate without key iteration.

pub mod chunks;
pub mod key;
pub mod metadata;
pub mod version;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use http::StatusCode;
use sha2::{Digest, Sha256};

use crate::background::BackgroundGate;
use crate::config::CacheSettings;
use crate::error::ServiceError;
use crate::response::{Body, ServiceResponse};
use crate::storage::{KvError, KvStore};
use crate::transform::TransformOptions;

pub use chunks::{parse_range_header, ByteRange, RangeOutcome};
pub use key::CacheKey;
pub use metadata::CacheEntryMetadata;
pub use version::CacheVersionStore;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
    #[error("cache body read error: {0}")]
    Body(String),
}

impl From<CacheError> for ServiceError {
    fn from(err: CacheError) -> Self {
        ServiceError::Cache(err.to_string())
    }
}

/// Read conditions for a cache probe.
#[derive(Debug, Clone, Default)]
pub struct GetConditions {
    /// Raw `Range` header, passed through from the client.
    pub range: Option<String>,
    /// Raw `If-None-Match` header.
    pub if_none_match: Option<String>,
    /// Current cache version; entries written under an older version miss.
    pub cache_version: u32,
}

impl GetConditions {
    pub fn with_version(cache_version: u32) -> Self {
        Self {
            cache_version,
            ..Default::default()
        }
    }
}

/// A successful cache read.
pub struct CacheHit {
    pub response: ServiceResponse,
    /// The entry is near expiry; the caller should schedule revalidation
    /// while still serving these bytes.
    pub revalidate: bool,
}

/// Everything needed to persist one artifact.
pub struct StoreRequest {
    pub key: CacheKey,
    pub source_path: String,
    pub options: TransformOptions,
    pub content_type: String,
    pub etag: Option<String>,
    pub cache_tags: Vec<String>,
    /// Caller-supplied TTL override; profiles apply otherwise.
    pub ttl_seconds: Option<u64>,
    pub cache_version: u32,
    /// Known body size, when the response declared one.
    pub content_length_hint: Option<u64>,
    pub body: Body,
}

/// Metadata summary of one stored variant.
#[derive(Debug, Clone)]
pub struct VariantSummary {
    pub key: String,
    pub metadata: Option<CacheEntryMetadata>,
}

pub struct VideoResultCache {
    kv: Arc<dyn KvStore>,
    gate: Arc<dyn BackgroundGate>,
    settings: CacheSettings,
}

impl VideoResultCache {
    pub fn new(
        kv: Arc<dyn KvStore>,
        gate: Arc<dyn BackgroundGate>,
        settings: CacheSettings,
    ) -> Self {
        Self { kv, gate, settings }
    }

    /// Probe the cache. Stale or version-invalidated entries read as misses
    /// and are deleted in the background.
    pub async fn get(
        &self,
        key: &CacheKey,
        conditions: &GetConditions,
    ) -> Result<Option<CacheHit>, CacheError> {
        let base_key = key.to_string();
        let Some(entry) = self.kv.get(&base_key).await? else {
            return Ok(None);
        };
        let Some(raw_metadata) = entry.metadata else {
            tracing::warn!(key = %base_key, "cache entry without metadata, treating as miss");
            return Ok(None);
        };
        let metadata: CacheEntryMetadata = match serde_json::from_value(raw_metadata) {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(key = %base_key, error = %err, "unreadable cache metadata");
                return Ok(None);
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        if metadata.cache_version < conditions.cache_version {
            tracing::debug!(
                key = %base_key,
                entry_version = metadata.cache_version,
                current_version = conditions.cache_version,
                "cache entry invalidated by version bump"
            );
            self.schedule_delete(key, &metadata);
            return Ok(None);
        }
        if !metadata.is_fresh(now_ms) {
            self.schedule_delete(key, &metadata);
            return Ok(None);
        }

        let etag = effective_etag(&metadata, &base_key);
        let total = metadata.actual_total_video_size;

        // Conditional hit: empty body, the entry's length unchanged.
        if conditions.if_none_match.as_deref() == Some(etag.as_str()) {
            let mut response = ServiceResponse::new(StatusCode::NOT_MODIFIED);
            self.common_headers(&mut response, &metadata, &etag, now_ms);
            response.set_header("content-length", &total.to_string());
            return Ok(Some(CacheHit {
                response,
                revalidate: metadata.needs_refresh(&self.settings.refresh, now_ms),
            }));
        }

        let range_outcome = match conditions.range.as_deref() {
            Some(header) => parse_range_header(header, total),
            None => RangeOutcome::Full,
        };

        if range_outcome == RangeOutcome::Unsatisfiable {
            let mut response = ServiceResponse::new(StatusCode::RANGE_NOT_SATISFIABLE);
            self.common_headers(&mut response, &metadata, &etag, now_ms);
            response.set_header("content-range", &format!("bytes */{}", total));
            response.set_header("content-length", "0");
            return Ok(Some(CacheHit {
                response,
                revalidate: false,
            }));
        }

        let range = match range_outcome {
            RangeOutcome::Partial(range) => Some(range),
            _ => None,
        };

        let body = if metadata.is_chunked {
            self.chunked_body(key, &metadata, range, total)?
        } else {
            let bytes = entry.value;
            match range {
                Some(range) => {
                    let start = range.start.min(bytes.len() as u64) as usize;
                    let end = range.end.min(bytes.len() as u64) as usize;
                    Body::Full(bytes.slice(start..end))
                }
                None => Body::Full(bytes),
            }
        };

        let mut response = match range {
            Some(range) => {
                let mut response = ServiceResponse::new(StatusCode::PARTIAL_CONTENT);
                response.set_header("content-length", &range.len().to_string());
                response.set_header(
                    "content-range",
                    &format!("bytes {}-{}/{}", range.start, range.end - 1, total),
                );
                response
            }
            None => {
                let mut response = ServiceResponse::new(StatusCode::OK);
                response.set_header("content-length", &total.to_string());
                response
            }
        };
        self.common_headers(&mut response, &metadata, &etag, now_ms);
        response.body = body;

        Ok(Some(CacheHit {
            revalidate: metadata.needs_refresh(&self.settings.refresh, now_ms),
            response,
        }))
    }

    fn common_headers(
        &self,
        response: &mut ServiceResponse,
        metadata: &CacheEntryMetadata,
        etag: &str,
        now_ms: i64,
    ) {
        response.set_header("content-type", &metadata.content_type);
        response.set_header("etag", etag);
        response.set_header("accept-ranges", "bytes");
        match metadata.remaining_ttl_seconds(now_ms) {
            Some(remaining) => {
                response.set_header("cache-control", &format!("public, max-age={}", remaining))
            }
            None => response.set_header("cache-control", "public"),
        }
        if !metadata.cache_tags.is_empty() {
            response.set_header("cache-tag", &metadata.cache_tags.join(","));
        }
    }

    /// Lazily stream the chunks intersecting the requested range. Only the
    /// needed chunks are fetched, one at a time.
    fn chunked_body(
        &self,
        key: &CacheKey,
        metadata: &CacheEntryMetadata,
        range: Option<ByteRange>,
        total: u64,
    ) -> Result<Body, CacheError> {
        let chunk_size = metadata.chunk_size.ok_or_else(|| {
            CacheError::Corrupt("chunked entry without chunkSize".to_string())
        })?;
        if chunk_size == 0 {
            return Err(CacheError::Corrupt("chunked entry with zero chunkSize".to_string()));
        }
        let range = range.unwrap_or(ByteRange { start: 0, end: total });
        let plan: Vec<(String, usize, usize)> = chunks::chunk_span(range, chunk_size)
            .into_iter()
            .map(|slice| (key.chunk_key(slice.index), slice.start, slice.end))
            .collect();

        let kv = Arc::clone(&self.kv);
        let stream = futures::stream::try_unfold(
            (kv, plan.into_iter()),
            |(kv, mut plan)| async move {
                let Some((chunk_key, start, end)) = plan.next() else {
                    return Ok(None);
                };
                let entry = kv.get(&chunk_key).await.map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                })?;
                let Some(entry) = entry else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("missing cache chunk '{}'", chunk_key),
                    ));
                };
                let len = entry.value.len();
                let bytes = entry.value.slice(start.min(len)..end.min(len));
                Ok(Some((bytes, (kv, plan))))
            },
        );
        Ok(Body::from_stream(stream))
    }

    /// Persist an artifact. Returns `false` when the artifact was skipped
    /// (uncacheable path, over the size limit) or a partial write had to be
    /// rolled back.
    pub async fn store(&self, request: StoreRequest) -> Result<bool, CacheError> {
        let source_path = key::normalize_path(&request.source_path);
        if !self.settings.cacheable_path(&source_path) {
            tracing::debug!(path = %source_path, "path profile marks entry uncacheable");
            return Ok(false);
        }
        if let (Some(max), Some(hint)) =
            (self.settings.max_size_bytes, request.content_length_hint)
        {
            if hint > max {
                tracing::debug!(size = hint, limit = max, "body exceeds cache size limit");
                return Ok(false);
            }
        }

        let ttl_seconds = request
            .ttl_seconds
            .unwrap_or_else(|| self.settings.ttl_for_path(&source_path).ok);
        let expiration_ttl = if self.settings.store_indefinitely {
            None
        } else {
            Some(ttl_seconds)
        };

        let now_ms = Utc::now().timestamp_millis();
        let mut metadata = CacheEntryMetadata::from_options(&source_path, &request.options);
        metadata.content_type = request.content_type.clone();
        metadata.etag = request.etag.clone();
        metadata.cache_tags = request.cache_tags.clone();
        metadata.created_at = now_ms;
        metadata.expires_at = expiration_ttl.map(|ttl| now_ms + ttl as i64 * 1000);
        metadata.cache_version = request.cache_version;

        let single_limit = self.settings.single_entry_max_bytes;
        match request.content_length_hint {
            Some(size) if size > single_limit => {
                self.store_chunked(&request.key, metadata, request.body, expiration_ttl)
                    .await
            }
            _ => {
                // Unknown or small size: buffer up to the threshold, then
                // spill into the chunked layout.
                let mut buffer = BytesMut::new();
                let mut stream = into_stream(request.body);
                let mut spilled = false;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| CacheError::Body(e.to_string()))?;
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() as u64 > single_limit {
                        spilled = true;
                        break;
                    }
                }
                if spilled {
                    let remainder = Body::from_stream(stream);
                    let prefix = buffer.freeze();
                    let body = concat_bodies(prefix, remainder);
                    self.store_chunked(&request.key, metadata, body, expiration_ttl)
                        .await
                } else {
                    self.store_single(&request.key, metadata, buffer.freeze(), expiration_ttl)
                        .await
                }
            }
        }
    }

    async fn store_single(
        &self,
        key: &CacheKey,
        mut metadata: CacheEntryMetadata,
        bytes: Bytes,
        expiration_ttl: Option<u64>,
    ) -> Result<bool, CacheError> {
        if let Some(max) = self.settings.max_size_bytes {
            if bytes.len() as u64 > max {
                return Ok(false);
            }
        }
        metadata.is_chunked = false;
        metadata.content_length = bytes.len() as u64;
        metadata.actual_total_video_size = bytes.len() as u64;

        let metadata_value = serde_json::to_value(&metadata)
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        self.kv
            .put(&key.to_string(), bytes, Some(metadata_value), expiration_ttl)
            .await?;
        crate::metrics::ProxyMetrics::global()
            .cache_writes
            .with_label_values(&["single"])
            .inc();
        tracing::debug!(key = %key, size = metadata.content_length, "stored single cache entry");
        Ok(true)
    }

    /// Chunks are written in ascending index order, the manifest last.
    /// Readers ignore chunks without a manifest, so a failed write only
    /// leaves orphans for the KV TTL to sweep; we still delete them
    /// best-effort.
    async fn store_chunked(
        &self,
        key: &CacheKey,
        mut metadata: CacheEntryMetadata,
        body: Body,
        expiration_ttl: Option<u64>,
    ) -> Result<bool, CacheError> {
        let chunk_size = self.settings.chunk_size_bytes as usize;
        let mut stream = into_stream(body);
        let mut buffer = BytesMut::new();
        let mut index: u32 = 0;
        let mut total: u64 = 0;

        loop {
            let next = stream.next().await;
            match next {
                Some(Ok(chunk)) => {
                    buffer.extend_from_slice(&chunk);
                    total += chunk.len() as u64;
                    if let Some(max) = self.settings.max_size_bytes {
                        if total > max {
                            tracing::debug!(key = %key, size = total, "body exceeded cache size limit mid-stream");
                            self.cleanup_chunks(key, index).await;
                            return Ok(false);
                        }
                    }
                    while buffer.len() >= chunk_size {
                        let piece = buffer.split_to(chunk_size).freeze();
                        if !self.write_chunk(key, index, piece, expiration_ttl).await {
                            self.cleanup_chunks(key, index).await;
                            return Ok(false);
                        }
                        index += 1;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(key = %key, error = %err, "body stream failed during cache write");
                    self.cleanup_chunks(key, index).await;
                    return Ok(false);
                }
                None => break,
            }
        }
        if !buffer.is_empty() {
            let piece = buffer.freeze();
            if !self.write_chunk(key, index, piece, expiration_ttl).await {
                self.cleanup_chunks(key, index).await;
                return Ok(false);
            }
            index += 1;
        }

        metadata.is_chunked = true;
        metadata.content_length = total;
        metadata.actual_total_video_size = total;
        metadata.chunk_count = Some(index);
        metadata.chunk_size = Some(chunk_size as u64);

        let metadata_value = serde_json::to_value(&metadata)
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        if let Err(err) = self
            .kv
            .put(&key.to_string(), Bytes::new(), Some(metadata_value), expiration_ttl)
            .await
        {
            tracing::warn!(key = %key, error = %err, "manifest write failed");
            self.cleanup_chunks(key, index).await;
            return Ok(false);
        }
        crate::metrics::ProxyMetrics::global()
            .cache_writes
            .with_label_values(&["chunked"])
            .inc();
        tracing::debug!(key = %key, chunks = index, size = total, "stored chunked cache entry");
        Ok(true)
    }

    async fn write_chunk(
        &self,
        key: &CacheKey,
        index: u32,
        bytes: Bytes,
        expiration_ttl: Option<u64>,
    ) -> bool {
        match self
            .kv
            .put(&key.chunk_key(index), bytes, None, expiration_ttl)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(key = %key, chunk = index, error = %err, "chunk write failed");
                false
            }
        }
    }

    async fn cleanup_chunks(&self, key: &CacheKey, written: u32) {
        for index in 0..written {
            let _ = self.kv.delete(&key.chunk_key(index)).await;
        }
    }

    /// Metadata summaries for every stored variant of a source path. Chunk
    /// keys are collapsed into their base entry.
    pub async fn list(&self, source_path: &str) -> Result<Vec<VariantSummary>, CacheError> {
        let prefix = CacheKey::variant_prefix(source_path);
        let entries = self.kv.list(&prefix).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.key.contains(":chunk="))
            .map(|entry| VariantSummary {
                metadata: entry
                    .metadata
                    .and_then(|raw| serde_json::from_value(raw).ok()),
                key: entry.key,
            })
            .collect())
    }

    /// Delete an entry and its chunks.
    pub async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let base_key = key.to_string();
        if let Some(entry) = self.kv.get(&base_key).await? {
            if let Some(metadata) = entry
                .metadata
                .and_then(|raw| serde_json::from_value::<CacheEntryMetadata>(raw).ok())
            {
                for index in 0..metadata.chunk_count.unwrap_or(0) {
                    let _ = self.kv.delete(&key.chunk_key(index)).await;
                }
            }
        }
        self.kv.delete(&base_key).await?;
        Ok(())
    }

    fn schedule_delete(&self, key: &CacheKey, metadata: &CacheEntryMetadata) {
        let kv = Arc::clone(&self.kv);
        let base_key = key.to_string();
        let chunk_keys: Vec<String> = (0..metadata.chunk_count.unwrap_or(0))
            .map(|index| key.chunk_key(index))
            .collect();
        self.gate.spawn(
            "cache-delete",
            Box::pin(async move {
                for chunk_key in &chunk_keys {
                    let _ = kv.delete(chunk_key).await;
                }
                kv.delete(&base_key)
                    .await
                    .map_err(|e| ServiceError::Cache(e.to_string()))?;
                Ok(())
            }),
        );
    }
}

/// ETag for a cached entry: the stored one, else a stable hash of the key
/// and version.
fn effective_etag(metadata: &CacheEntryMetadata, base_key: &str) -> String {
    if let Some(etag) = &metadata.etag {
        return etag.clone();
    }
    stable_etag(base_key, metadata.cache_version)
}

/// Deterministic etag for artifacts whose origin supplied none. Warm and
/// cold responses for the same key and version agree on this value.
pub fn stable_etag(base_key: &str, cache_version: u32) -> String {
    let digest = Sha256::digest(format!("{}:{}", base_key, cache_version).as_bytes());
    format!("\"{}\"", hex::encode(&digest[..16]))
}

fn into_stream(body: Body) -> crate::response::BodyStream {
    match body {
        Body::Empty => Box::pin(futures::stream::empty()),
        Body::Full(bytes) => Box::pin(futures::stream::once(async move { Ok(bytes) })),
        Body::Stream(stream) => stream,
    }
}

fn concat_bodies(prefix: Bytes, rest: Body) -> Body {
    let head = futures::stream::once(async move { Ok(prefix) });
    Body::from_stream(head.chain(into_stream(rest)))
}
