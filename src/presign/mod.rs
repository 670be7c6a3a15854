//! Presigned URL cache
//!
//! Freshly minted presigned URLs are reused across requests so signing CPU
//! is paid once per expiry window. The KV value is empty; everything lives
//! in metadata, which list/get operations read opportunistically. Stores
//! run off the hot path through the background gate; concurrent refreshes
//! are last-writer-wins since both URLs stay valid during the overlap.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::background::BackgroundGate;
use crate::cache::key::normalize_path;
use crate::config::SourceType;
use crate::constants::{DEFAULT_PRESIGN_REFRESH_THRESHOLD_SECS, PRESIGN_KEY_PREFIX};
use crate::error::ServiceError;
use crate::storage::KvStore;

/// Identity of a presigned URL: where it points and how it was signed.
#[derive(Debug, Clone)]
pub struct PresignLookup {
    pub storage_type: SourceType,
    pub auth_kind: String,
    pub region: Option<String>,
    pub service: Option<String>,
}

/// Everything recorded about a minted URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlEntry {
    pub signed_url: String,
    pub original_url: String,
    pub path: String,
    pub storage_type: String,
    pub auth_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// The signature query substring, kept for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds.
    pub expires_at: i64,
}

impl PresignedUrlEntry {
    pub fn new(
        signed_url: String,
        original_url: String,
        path: &str,
        lookup: &PresignLookup,
        expires_in_seconds: u64,
    ) -> Self {
        let now_ms = Utc::now().timestamp_millis();
        Self {
            auth_token: extract_signature(&signed_url),
            signed_url,
            original_url,
            path: normalize_path(path),
            storage_type: lookup.storage_type.to_string(),
            auth_type: lookup.auth_kind.clone(),
            region: lookup.region.clone(),
            service: lookup.service.clone(),
            created_at: now_ms,
            expires_at: now_ms + expires_in_seconds as i64 * 1000,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    /// Within `threshold` seconds of expiry.
    pub fn is_expiring(&self, threshold_seconds: u64, now_ms: i64) -> bool {
        self.expires_at - now_ms <= threshold_seconds as i64 * 1000
    }
}

fn extract_signature(url: &str) -> Option<String> {
    crate::request::query_pairs_of(url)
        .into_iter()
        .find(|(name, _)| name == "X-Amz-Signature")
        .map(|(_, value)| value)
}

#[derive(Clone)]
pub struct PresignedUrlCache {
    kv: Arc<dyn KvStore>,
}

impl PresignedUrlCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Key form:
    /// `presigned:<storageType>:<normalized-path>:auth=<authType>[:region=<r>][:service=<s>]`
    pub fn key_for(path: &str, lookup: &PresignLookup) -> String {
        let mut key = format!(
            "{}:{}:{}:auth={}",
            PRESIGN_KEY_PREFIX,
            lookup.storage_type,
            normalize_path(path),
            lookup.auth_kind
        );
        if let Some(region) = &lookup.region {
            key.push_str(&format!(":region={}", region));
        }
        if let Some(service) = &lookup.service {
            key.push_str(&format!(":service={}", service));
        }
        key
    }

    /// A cached URL, or `None` when absent or at/past expiry. KV failures
    /// read as misses.
    pub async fn get(&self, path: &str, lookup: &PresignLookup) -> Option<PresignedUrlEntry> {
        let key = Self::key_for(path, lookup);
        let entry = match self.kv.get(&key).await {
            Ok(entry) => entry?,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "presign cache read failed");
                return None;
            }
        };
        let parsed: PresignedUrlEntry = match entry
            .metadata
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(parsed)) => parsed,
            _ => {
                tracing::warn!(key = %key, "presign cache entry without readable metadata");
                return None;
            }
        };
        if parsed.is_expired(Utc::now().timestamp_millis()) {
            return None;
        }
        Some(parsed)
    }

    /// Persist a minted URL. Callers dispatch this through the background
    /// gate; it is never on the hot path.
    pub async fn store(&self, entry: &PresignedUrlEntry, lookup: &PresignLookup) -> bool {
        let key = Self::key_for(&entry.path, lookup);
        let metadata = match serde_json::to_value(entry) {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "presign entry serialization failed");
                return false;
            }
        };
        let now_ms = Utc::now().timestamp_millis();
        let ttl_seconds = ((entry.expires_at - now_ms) / 1000).max(0) as u64;
        if ttl_seconds == 0 {
            return false;
        }
        match self
            .kv
            .put(&key, Bytes::new(), Some(metadata), Some(ttl_seconds))
            .await
        {
            Ok(()) => {
                tracing::debug!(key = %key, ttl = ttl_seconds, "presigned url cached");
                true
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "presign cache write failed");
                false
            }
        }
    }

    /// Refresh a cached URL when it is close to expiry. No-op otherwise.
    /// Returns whether a refresh occurred.
    pub async fn refresh<F, Fut>(
        &self,
        entry: &PresignedUrlEntry,
        lookup: &PresignLookup,
        threshold_seconds: Option<u64>,
        mint: F,
    ) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<PresignedUrlEntry, ServiceError>>,
    {
        let threshold = threshold_seconds.unwrap_or(DEFAULT_PRESIGN_REFRESH_THRESHOLD_SECS);
        if !entry.is_expiring(threshold, Utc::now().timestamp_millis()) {
            return false;
        }
        match mint().await {
            Ok(fresh) => self.store(&fresh, lookup).await,
            Err(err) => {
                tracing::warn!(path = %entry.path, error = %err, "presign refresh mint failed");
                false
            }
        }
    }
}

/// The effective URL for a source signed with `aws-s3-presigned-url`:
/// reuse a cached URL when one is fresh, mint otherwise. Cache writes and
/// near-expiry refreshes run through the background gate so signing never
/// delays the response; when no facility exists they are dropped.
pub async fn signed_url_for_source(
    source_path: &str,
    plain_url: &str,
    auth: &crate::config::AuthConfig,
    source_type: SourceType,
    env: &Arc<dyn crate::storage::SecretEnv>,
    cache: &PresignedUrlCache,
    gate: &Arc<dyn BackgroundGate>,
) -> Result<String, ServiceError> {
    use crate::config::AuthConfig;

    let (region, service, expires_in) = match auth {
        AuthConfig::AwsS3PresignedUrl {
            region,
            service,
            expires_in_seconds,
            ..
        } => (
            region.clone(),
            service.clone(),
            expires_in_seconds.unwrap_or(crate::constants::DEFAULT_PRESIGN_EXPIRES_SECS),
        ),
        _ => {
            // Not a presigned scheme; the caller applies auth directly.
            return Ok(plain_url.to_string());
        }
    };

    let lookup = PresignLookup {
        storage_type: source_type,
        auth_kind: auth.kind_label().to_string(),
        region,
        service,
    };

    if let Some(entry) = cache.get(source_path, &lookup).await {
        if entry.is_expiring(
            DEFAULT_PRESIGN_REFRESH_THRESHOLD_SECS,
            Utc::now().timestamp_millis(),
        ) {
            let cache_clone = cache.clone();
            let lookup_clone = lookup.clone();
            let auth_clone = auth.clone();
            let env_clone = Arc::clone(env);
            let plain = plain_url.to_string();
            let path = source_path.to_string();
            gate.spawn(
                "presign-refresh",
                Box::pin(async move {
                    let entry = cache_clone
                        .get(&path, &lookup_clone)
                        .await
                        .ok_or_else(|| ServiceError::Cache("presign entry vanished".into()))?;
                    let refreshed = cache_clone
                        .refresh(&entry, &lookup_clone, None, || async {
                            mint_entry(&path, &plain, &auth_clone, &lookup_clone, expires_in, env_clone.as_ref())
                        })
                        .await;
                    if refreshed {
                        crate::metrics::ProxyMetrics::global()
                            .presign_events
                            .with_label_values(&["refresh"])
                            .inc();
                    }
                    Ok(())
                }),
            );
        }
        tracing::debug!(path = %source_path, "reusing cached presigned url");
        crate::metrics::ProxyMetrics::global()
            .presign_events
            .with_label_values(&["reuse"])
            .inc();
        return Ok(entry.signed_url);
    }

    let entry = mint_entry(source_path, plain_url, auth, &lookup, expires_in, env.as_ref())?;
    crate::metrics::ProxyMetrics::global()
        .presign_events
        .with_label_values(&["mint"])
        .inc();
    let signed_url = entry.signed_url.clone();

    let cache_clone = cache.clone();
    let lookup_clone = lookup.clone();
    let accepted = gate.spawn(
        "presign-store",
        Box::pin(async move {
            cache_clone.store(&entry, &lookup_clone).await;
            Ok(())
        }),
    );
    if !accepted {
        tracing::debug!(path = %source_path, "presign store dropped, no background facility");
    }
    Ok(signed_url)
}

fn mint_entry(
    source_path: &str,
    plain_url: &str,
    auth: &crate::config::AuthConfig,
    lookup: &PresignLookup,
    expires_in: u64,
    env: &dyn crate::storage::SecretEnv,
) -> Result<PresignedUrlEntry, ServiceError> {
    let signed = crate::auth::apply_auth(
        crate::storage::HttpRequest::get(plain_url),
        auth,
        env,
    )?;
    Ok(PresignedUrlEntry::new(
        signed.url,
        plain_url.to_string(),
        source_path,
        lookup,
        expires_in,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryKvStore;

    fn lookup() -> PresignLookup {
        PresignLookup {
            storage_type: SourceType::Remote,
            auth_kind: "aws-s3-presigned-url".to_string(),
            region: Some("us-east-1".to_string()),
            service: Some("s3".to_string()),
        }
    }

    fn entry(expires_in: u64) -> PresignedUrlEntry {
        PresignedUrlEntry::new(
            "https://bucket.s3.us-east-1.amazonaws.com/videos/test.mp4?X-Amz-Signature=deadbeef&X-Amz-Expires=3600".to_string(),
            "https://bucket.s3.us-east-1.amazonaws.com/videos/test.mp4".to_string(),
            "/videos/test.mp4",
            &lookup(),
            expires_in,
        )
    }

    #[test]
    fn test_key_form() {
        assert_eq!(
            PresignedUrlCache::key_for("/videos/test.mp4", &lookup()),
            "presigned:remote:videos/test.mp4:auth=aws-s3-presigned-url:region=us-east-1:service=s3"
        );
    }

    #[test]
    fn test_key_omits_absent_region_and_service() {
        let lookup = PresignLookup {
            storage_type: SourceType::Fallback,
            auth_kind: "aws-s3-presigned-url".to_string(),
            region: None,
            service: None,
        };
        assert_eq!(
            PresignedUrlCache::key_for("a b.mp4", &lookup),
            "presigned:fallback:a-b.mp4:auth=aws-s3-presigned-url"
        );
    }

    #[test]
    fn test_signature_substring_is_extracted() {
        assert_eq!(entry(3600).auth_token.as_deref(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn test_store_then_get_round_trips() {
        let cache = PresignedUrlCache::new(Arc::new(MemoryKvStore::new()));
        let entry = entry(3600);
        assert!(cache.store(&entry, &lookup()).await);

        let cached = cache
            .get("/videos/test.mp4", &lookup())
            .await
            .expect("entry should be cached");
        assert_eq!(cached.signed_url, entry.signed_url);
        assert_eq!(cached.auth_token, entry.auth_token);
    }

    #[tokio::test]
    async fn test_value_is_empty_everything_in_metadata() {
        let kv = Arc::new(MemoryKvStore::new());
        let cache = PresignedUrlCache::new(Arc::clone(&kv) as Arc<dyn KvStore>);
        let entry = entry(3600);
        cache.store(&entry, &lookup()).await;

        let raw = kv
            .get(&PresignedUrlCache::key_for(&entry.path, &lookup()))
            .await
            .unwrap()
            .unwrap();
        assert!(raw.value.is_empty());
        assert_eq!(raw.metadata.unwrap()["signedUrl"], entry.signed_url);
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_none() {
        let cache = PresignedUrlCache::new(Arc::new(MemoryKvStore::new()));
        let mut stale = entry(3600);
        stale.expires_at = Utc::now().timestamp_millis() - 1000;
        // Bypass store's ttl guard to simulate an entry aging out in place.
        assert!(!cache.store(&stale, &lookup()).await);
        assert!(cache.get("/videos/test.mp4", &lookup()).await.is_none());
    }

    #[test]
    fn test_is_expiring_threshold() {
        let entry = entry(3600);
        let now_ms = Utc::now().timestamp_millis();
        assert!(!entry.is_expiring(300, now_ms), "an hour out is not expiring at 300s");
        assert!(entry.is_expiring(4000, now_ms), "threshold beyond lifetime flags expiring");
    }

    #[tokio::test]
    async fn test_refresh_noop_when_not_expiring() {
        let cache = PresignedUrlCache::new(Arc::new(MemoryKvStore::new()));
        let entry = entry(3600);
        let refreshed = cache
            .refresh(&entry, &lookup(), Some(300), || async {
                panic!("mint must not be called when the entry is fresh")
            })
            .await;
        assert!(!refreshed);
    }

    #[tokio::test]
    async fn test_signed_url_for_source_reuses_cached_signature() {
        use crate::background::{BackgroundGate, TokioGate};
        use crate::storage::{SecretEnv, StaticEnv};

        let cache = PresignedUrlCache::new(Arc::new(MemoryKvStore::new()));
        let tokio_gate = Arc::new(TokioGate::new(std::time::Duration::from_secs(5)));
        let gate: Arc<dyn BackgroundGate> = Arc::clone(&tokio_gate) as Arc<dyn BackgroundGate>;
        let env: Arc<dyn SecretEnv> =
            Arc::new(StaticEnv::new(&[("AK", "AKIAEXAMPLE"), ("SK", "secret")]));
        let auth: crate::config::AuthConfig = serde_yaml::from_str(
            "type: aws-s3-presigned-url\naccessKeyVar: AK\nsecretKeyVar: SK\nregion: us-east-1\nexpiresInSeconds: 3600\n",
        )
        .unwrap();

        let first = signed_url_for_source(
            "/videos/test.mp4",
            "https://bucket.s3.us-east-1.amazonaws.com/videos/test.mp4",
            &auth,
            SourceType::Remote,
            &env,
            &cache,
            &gate,
        )
        .await
        .unwrap();

        // Let the background store land before the second request.
        tokio_gate.drain().await;

        let second = signed_url_for_source(
            "/videos/test.mp4",
            "https://bucket.s3.us-east-1.amazonaws.com/videos/test.mp4",
            &auth,
            SourceType::Remote,
            &env,
            &cache,
            &gate,
        )
        .await
        .unwrap();

        let signature = |url: &str| {
            crate::request::query_pairs_of(url)
                .into_iter()
                .find(|(k, _)| k == "X-Amz-Signature")
                .map(|(_, v)| v)
        };
        assert_eq!(signature(&first), signature(&second), "second request reuses the signature");
    }

    #[tokio::test]
    async fn test_refresh_mints_and_stores_when_expiring() {
        let cache = PresignedUrlCache::new(Arc::new(MemoryKvStore::new()));
        let near_expiry = entry(100);
        let refreshed = cache
            .refresh(&near_expiry, &lookup(), Some(300), || async {
                Ok(entry(3600))
            })
            .await;
        assert!(refreshed);
        assert!(cache.get("/videos/test.mp4", &lookup()).await.is_some());
    }
}
