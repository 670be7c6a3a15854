//! Storage capabilities
//!
//! The host's KV namespaces and object buckets are duck-typed contracts,
//! modeled here as traits so the core stays portable and testable with
//! in-memory fakes. The real deployment plugs host bindings in through the
//! service context.

pub mod fetcher;
pub mod http;
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::response::ServiceResponse;

/// KV read result: value bytes plus opportunistically read JSON metadata.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub value: Bytes,
    pub metadata: Option<serde_json::Value>,
}

/// Key and metadata summary from a prefix listing.
#[derive(Debug, Clone)]
pub struct KvListEntry {
    pub key: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
    #[error("kv metadata serialization error: {0}")]
    Serialization(String),
}

/// A key-value namespace with JSON metadata sidecars and optional TTLs.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError>;

    /// Write a value with optional metadata and expiration TTL in seconds.
    /// Last writer wins.
    async fn put(
        &self,
        key: &str,
        value: Bytes,
        metadata: Option<serde_json::Value>,
        expiration_ttl: Option<u64>,
    ) -> Result<(), KvError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Enumerate keys with the given prefix, returning metadata summaries.
    async fn list(&self, prefix: &str) -> Result<Vec<KvListEntry>, KvError>;
}

/// Byte range of an object read. `length` of `None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRange {
    pub offset: u64,
    pub length: Option<u64>,
}

/// Conditions and range for a bucket read.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub range: Option<ObjectRange>,
    /// Return `NotModified` when the stored etag matches.
    pub if_none_match: Option<String>,
}

/// A bucket object read result.
#[derive(Debug, Clone)]
pub struct BucketObject {
    pub body: Bytes,
    pub etag: String,
    pub content_type: Option<String>,
    /// Total object size, independent of any range applied.
    pub size: u64,
}

/// Object metadata without the body.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub etag: String,
    pub content_type: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub enum BucketGetOutcome {
    Found(BucketObject),
    /// Conditional hit: the stored etag matched `if_none_match`.
    NotModified { etag: String },
    Missing,
    /// The requested range starts beyond the object size.
    RangeNotSatisfiable { size: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    #[error("bucket backend error: {0}")]
    Backend(String),
}

/// An r2-style object bucket binding with ranged and conditional reads.
#[async_trait]
pub trait ObjectBucket: Send + Sync {
    async fn get(&self, key: &str, options: GetOptions) -> Result<BucketGetOutcome, BucketError>;

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, BucketError>;
}

/// Outbound HTTP request descriptor.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: ::http::Method,
    pub url: String,
    pub headers: HashMap<String, String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: ::http::Method::GET,
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: ::http::Method::HEAD,
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch timed out after {0} seconds")]
    Timeout(u64),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Outbound HTTP capability. The production implementation wraps `reqwest`;
/// tests script responses.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn fetch(&self, request: HttpRequest) -> Result<ServiceResponse, FetchError>;
}

/// Environment variable lookup for credential resolution. Only names
/// declared in auth records are ever read.
pub trait SecretEnv: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// Process environment implementation.
pub struct ProcessEnv;

impl SecretEnv for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed map implementation for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticEnv {
    vars: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new(vars: &[(&str, &str)]) -> Self {
        Self {
            vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl SecretEnv for StaticEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned().filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_request_builder_lowercases_header_names() {
        let request = HttpRequest::get("https://origin.example.com/a.mp4")
            .with_header("Range", "bytes=0-1")
            .with_header("If-None-Match", "\"abc\"");
        assert_eq!(request.headers.get("range").map(String::as_str), Some("bytes=0-1"));
        assert_eq!(
            request.headers.get("if-none-match").map(String::as_str),
            Some("\"abc\"")
        );
    }

    #[test]
    fn test_static_env_filters_empty_values() {
        let env = StaticEnv::new(&[("PRESENT", "value"), ("EMPTY", "")]);
        assert_eq!(env.var("PRESENT").as_deref(), Some("value"));
        assert_eq!(env.var("EMPTY"), None);
        assert_eq!(env.var("ABSENT"), None);
    }

    #[test]
    fn test_object_range_equality() {
        let full = ObjectRange { offset: 0, length: None };
        let bounded = ObjectRange { offset: 0, length: Some(10) };
        assert_ne!(full, bounded);
    }
}
