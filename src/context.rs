//! Service context
//!
//! Explicit environment object threaded through the core entrypoints: the
//! configuration snapshot store, the compiled origin resolver, KV handles,
//! bucket bindings, the outbound HTTP client, the secret environment, and
//! the background gate. Tests inject alternate contexts with in-memory
//! implementations; there are no process-wide singletons to mutate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::background::{BackgroundGate, TokioGate};
use crate::cache::{CacheVersionStore, VideoResultCache};
use crate::config::{Config, ConfigStore};
use crate::error::ServiceError;
use crate::origins::OriginResolver;
use crate::presign::PresignedUrlCache;
use crate::storage::fetcher::StorageFetcher;
use crate::storage::http::ReqwestFetcher;
use crate::storage::memory::{MemoryBucket, MemoryKvStore};
use crate::storage::{HttpFetch, KvStore, ObjectBucket, ProcessEnv, SecretEnv};

/// Host-provided handles the context is built around.
pub struct ContextBindings {
    pub result_kv: Arc<dyn KvStore>,
    pub presign_kv: Arc<dyn KvStore>,
    /// Optional namespace backing the cache-version counter.
    pub version_kv: Option<Arc<dyn KvStore>>,
    pub buckets: HashMap<String, Arc<dyn ObjectBucket>>,
    pub http: Arc<dyn HttpFetch>,
    pub env: Arc<dyn SecretEnv>,
    pub gate: Arc<dyn BackgroundGate>,
}

pub struct ServiceContext {
    config: ConfigStore,
    resolver: ArcSwap<OriginResolver>,
    pub result_kv: Arc<dyn KvStore>,
    pub presign_kv: Arc<dyn KvStore>,
    pub version_kv: Option<Arc<dyn KvStore>>,
    pub buckets: Arc<HashMap<String, Arc<dyn ObjectBucket>>>,
    pub http: Arc<dyn HttpFetch>,
    pub env: Arc<dyn SecretEnv>,
    pub gate: Arc<dyn BackgroundGate>,
}

impl ServiceContext {
    pub fn new(config: Config, bindings: ContextBindings) -> Result<Arc<Self>, ServiceError> {
        let resolver = OriginResolver::new(&config)?;
        Ok(Arc::new(Self {
            config: ConfigStore::new(config),
            resolver: ArcSwap::from_pointee(resolver),
            result_kv: bindings.result_kv,
            presign_kv: bindings.presign_kv,
            version_kv: bindings.version_kv,
            buckets: Arc::new(bindings.buckets),
            http: bindings.http,
            env: bindings.env,
            gate: bindings.gate,
        }))
    }

    /// Context with in-memory stores and a live HTTP client. Used for local
    /// development and as the base for test contexts.
    pub fn with_memory_bindings(config: Config) -> Result<Arc<Self>, ServiceError> {
        let settings = config.cache_settings();
        let http = ReqwestFetcher::new(settings.fetch_timeout_seconds)
            .map_err(|e| ServiceError::Configuration(e.to_string()))?;
        let mut buckets: HashMap<String, Arc<dyn ObjectBucket>> = HashMap::new();
        // Every binding the origin table references gets a fresh bucket.
        for origin in config.origins() {
            for source in &origin.sources {
                if let crate::config::SourceConfig::R2 { bucket_binding, .. } = source {
                    buckets
                        .entry(bucket_binding.clone())
                        .or_insert_with(|| Arc::new(MemoryBucket::new()) as Arc<dyn ObjectBucket>);
                }
            }
        }
        Self::new(
            config,
            ContextBindings {
                result_kv: Arc::new(MemoryKvStore::new()),
                presign_kv: Arc::new(MemoryKvStore::new()),
                version_kv: Some(Arc::new(MemoryKvStore::new())),
                buckets,
                http: Arc::new(http),
                env: Arc::new(ProcessEnv),
                gate: Arc::new(TokioGate::new(Duration::from_secs(
                    settings.fetch_timeout_seconds,
                ))),
            },
        )
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.config.snapshot()
    }

    pub fn resolver(&self) -> Arc<OriginResolver> {
        self.resolver.load_full()
    }

    pub fn has_bucket(&self, binding: &str) -> bool {
        self.buckets.contains_key(binding)
    }

    /// Hot reload: validate, swap the snapshot, recompile the resolver. On
    /// failure the previous snapshot and resolver stay in effect.
    pub fn reload(&self, config: Config) -> Result<(), ServiceError> {
        let resolver = OriginResolver::new(&config)?;
        self.config.replace(config)?;
        self.resolver.store(Arc::new(resolver));
        Ok(())
    }

    /// Section-wise partial update with the same swap semantics as reload.
    pub fn update(&self, partial: serde_json::Value) -> Result<(), ServiceError> {
        let updated = self.config.update(partial)?;
        let resolver = OriginResolver::new(&updated)?;
        self.resolver.store(Arc::new(resolver));
        Ok(())
    }

    /// Result cache bound to the current settings snapshot.
    pub fn result_cache(&self) -> VideoResultCache {
        VideoResultCache::new(
            Arc::clone(&self.result_kv),
            Arc::clone(&self.gate),
            self.snapshot().cache_settings(),
        )
    }

    pub fn presign_cache(&self) -> PresignedUrlCache {
        PresignedUrlCache::new(Arc::clone(&self.presign_kv))
    }

    pub fn version_store(&self) -> Option<CacheVersionStore> {
        self.version_kv
            .as_ref()
            .map(|kv| CacheVersionStore::new(Arc::clone(kv)))
    }

    pub fn storage_fetcher(&self) -> StorageFetcher {
        let settings = self.snapshot().cache_settings();
        StorageFetcher::new(
            Arc::clone(&self.buckets),
            Arc::clone(&self.http),
            Arc::clone(&self.env),
            self.presign_cache(),
            Arc::clone(&self.gate),
            Duration::from_secs(settings.failover_budget_seconds),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config::from_yaml_str(
            r#"
video:
  origins:
    - name: videos
      matcher: "^/videos/(.*)$"
      sources:
        - {type: r2, path: "${1}", bucketBinding: VIDEOS_BUCKET}
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_memory_context_binds_referenced_buckets() {
        let ctx = ServiceContext::with_memory_bindings(minimal_config()).unwrap();
        assert!(ctx.has_bucket("VIDEOS_BUCKET"));
        assert!(!ctx.has_bucket("OTHER_BUCKET"));
    }

    #[tokio::test]
    async fn test_reload_swaps_resolver() {
        let ctx = ServiceContext::with_memory_bindings(minimal_config()).unwrap();
        assert!(ctx.resolver().resolve("/videos/a.mp4", |_| true).is_ok());
        assert!(ctx.resolver().resolve("/clips/a.mp4", |_| true).is_err());

        let new_config = Config::from_yaml_str(
            r#"
video:
  origins:
    - name: clips
      matcher: "^/clips/(.*)$"
      sources:
        - {type: remote, path: "${1}", url: "https://origin.example.com"}
"#,
        )
        .unwrap();
        ctx.reload(new_config).unwrap();
        assert!(ctx.resolver().resolve("/clips/a.mp4", |_| true).is_ok());
        assert!(ctx.resolver().resolve("/videos/a.mp4", |_| true).is_err());
    }

    #[tokio::test]
    async fn test_failed_update_keeps_resolver() {
        let ctx = ServiceContext::with_memory_bindings(minimal_config()).unwrap();
        let result = ctx.update(serde_json::json!({"video": {"origins": []}}));
        assert!(result.is_err());
        assert!(ctx.resolver().resolve("/videos/a.mp4", |_| true).is_ok());
    }
}
