//! Multi-tier storage fetch with failover
//!
//! Sources are trialled strictly in order, one at a time. Range and
//! conditional headers pass through untouched; r2 reads are translated into
//! pseudo-responses so callers see one shape regardless of tier. A 404 or
//! transport failure moves on to the next source; any other 4xx stops the
//! cascade because the source is reachable but the request is wrong.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Method, StatusCode};

use super::{
    BucketGetOutcome, GetOptions, HttpFetch, HttpRequest, ObjectBucket, ObjectRange, SecretEnv,
};
use crate::background::BackgroundGate;
use crate::cache::chunks::{parse_range_header, RangeOutcome};
use crate::config::{AuthConfig, SourceType};
use crate::error::ServiceError;
use crate::origins::ResolvedSource;
use crate::presign::{signed_url_for_source, PresignedUrlCache};
use crate::response::{Body, ServiceResponse};

/// What the caller wants fetched: method plus pass-through conditions.
#[derive(Debug, Clone)]
pub struct FetchIntent {
    pub method: Method,
    pub range: Option<String>,
    pub if_none_match: Option<String>,
}

impl FetchIntent {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            range: None,
            if_none_match: None,
        }
    }

    pub fn from_request(request: &crate::request::IncomingRequest) -> Self {
        Self {
            method: request.method.clone(),
            range: request.header_str("range").map(str::to_string),
            if_none_match: request.header_str("if-none-match").map(str::to_string),
        }
    }
}

/// Unified result of a successful source trial.
#[derive(Debug)]
pub struct SourceResult {
    pub response: ServiceResponse,
    pub source_type: SourceType,
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

/// Per-source diagnostic recorded while cascading.
#[derive(Debug, Clone)]
pub struct SourceFailure {
    pub source_type: SourceType,
    pub path: String,
    pub detail: String,
    pub not_found: bool,
}

pub struct StorageFetcher {
    buckets: Arc<HashMap<String, Arc<dyn ObjectBucket>>>,
    http: Arc<dyn HttpFetch>,
    env: Arc<dyn SecretEnv>,
    presign_cache: PresignedUrlCache,
    gate: Arc<dyn BackgroundGate>,
    failover_budget: Duration,
}

impl StorageFetcher {
    pub fn new(
        buckets: Arc<HashMap<String, Arc<dyn ObjectBucket>>>,
        http: Arc<dyn HttpFetch>,
        env: Arc<dyn SecretEnv>,
        presign_cache: PresignedUrlCache,
        gate: Arc<dyn BackgroundGate>,
        failover_budget: Duration,
    ) -> Self {
        Self {
            buckets,
            http,
            env,
            presign_cache,
            gate,
            failover_budget,
        }
    }

    /// Trial the ordered sources until one succeeds. The overall pass is
    /// bounded by the failover budget so per-attempt timeouts cannot stack.
    pub async fn fetch(
        &self,
        sources: &[ResolvedSource],
        intent: &FetchIntent,
    ) -> Result<SourceResult, ServiceError> {
        if sources.is_empty() {
            return Err(ServiceError::NotFound("no eligible sources".to_string()));
        }

        let started = Instant::now();
        let mut failures: Vec<SourceFailure> = Vec::new();

        for source in sources {
            let remaining = self.failover_budget.checked_sub(started.elapsed());
            let Some(remaining) = remaining else {
                failures.push(SourceFailure {
                    source_type: source.source_type(),
                    path: source.path().to_string(),
                    detail: "failover budget exhausted".to_string(),
                    not_found: false,
                });
                break;
            };

            let attempt = self.try_source(source, intent);
            let outcome = match tokio::time::timeout(remaining, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    failures.push(SourceFailure {
                        source_type: source.source_type(),
                        path: source.path().to_string(),
                        detail: "attempt exceeded failover budget".to_string(),
                        not_found: false,
                    });
                    break;
                }
            };

            match outcome {
                Ok(Some(result)) => {
                    tracing::debug!(
                        source = %result.source_type,
                        path = %source.path(),
                        status = result.response.status.as_u16(),
                        "source fetch succeeded"
                    );
                    return Ok(result);
                }
                Ok(None) => {
                    // Missing at this tier; diagnostics recorded by the trial.
                    failures.push(SourceFailure {
                        source_type: source.source_type(),
                        path: source.path().to_string(),
                        detail: "not found".to_string(),
                        not_found: true,
                    });
                }
                Err(failure) => {
                    tracing::warn!(
                        source = %failure.source_type,
                        path = %failure.path,
                        detail = %failure.detail,
                        "source fetch failed, trying next"
                    );
                    crate::metrics::ProxyMetrics::global().source_failovers.inc();
                    failures.push(failure);
                }
            }
        }

        let diagnostics: Vec<String> = failures
            .iter()
            .map(|f| format!("{} '{}': {}", f.source_type, f.path, f.detail))
            .collect();
        let summary = format!("all sources failed: [{}]", diagnostics.join("; "));
        if failures.iter().all(|f| f.not_found) {
            Err(ServiceError::NotFound(summary))
        } else {
            Err(ServiceError::OriginUnavailable(summary))
        }
    }

    /// One source trial. `Ok(Some)` is a response to surface (success, 416,
    /// or a stop-the-cascade 4xx), `Ok(None)` means missing-try-next, `Err`
    /// is a recorded failure that also cascades.
    async fn try_source(
        &self,
        source: &ResolvedSource,
        intent: &FetchIntent,
    ) -> Result<Option<SourceResult>, SourceFailure> {
        match source {
            ResolvedSource::R2 { binding, path, .. } => {
                let bucket = self.buckets.get(binding).ok_or_else(|| SourceFailure {
                    source_type: SourceType::R2,
                    path: path.clone(),
                    detail: format!("bucket binding '{}' not live", binding),
                    not_found: false,
                })?;
                self.fetch_r2(bucket.as_ref(), path, intent).await
            }
            ResolvedSource::Remote { .. } | ResolvedSource::Fallback { .. } => {
                self.fetch_http(source, intent).await
            }
        }
    }

    async fn fetch_r2(
        &self,
        bucket: &dyn ObjectBucket,
        path: &str,
        intent: &FetchIntent,
    ) -> Result<Option<SourceResult>, SourceFailure> {
        let key = path.trim_start_matches('/');
        let fail = |detail: String| SourceFailure {
            source_type: SourceType::R2,
            path: path.to_string(),
            detail,
            not_found: false,
        };

        if intent.method == Method::HEAD {
            let info = bucket.head(key).await.map_err(|e| fail(e.to_string()))?;
            let Some(info) = info else {
                return Ok(None);
            };
            let mut response = ServiceResponse::new(StatusCode::OK);
            apply_object_headers(&mut response, info.content_type.as_deref(), info.size, &info.etag);
            return Ok(Some(SourceResult {
                content_type: info.content_type.clone(),
                size: Some(info.size),
                source_type: SourceType::R2,
                response,
            }));
        }

        // Suffix ranges need the total size before they translate to an
        // offset/length read.
        let object_range = match intent.range.as_deref() {
            None => None,
            Some(header) => {
                let total = match bucket.head(key).await.map_err(|e| fail(e.to_string()))? {
                    Some(info) => info.size,
                    None => return Ok(None),
                };
                match parse_range_header(header, total) {
                    RangeOutcome::Full => None,
                    RangeOutcome::Partial(range) => Some(ObjectRange {
                        offset: range.start,
                        length: Some(range.len()),
                    }),
                    RangeOutcome::Unsatisfiable => {
                        let mut response = ServiceResponse::new(StatusCode::RANGE_NOT_SATISFIABLE);
                        response.set_header("content-range", &format!("bytes */{}", total));
                        return Ok(Some(SourceResult {
                            response,
                            source_type: SourceType::R2,
                            content_type: None,
                            size: Some(total),
                        }));
                    }
                }
            }
        };

        let outcome = bucket
            .get(
                key,
                GetOptions {
                    range: object_range,
                    if_none_match: intent.if_none_match.clone(),
                },
            )
            .await
            .map_err(|e| fail(e.to_string()))?;

        match outcome {
            BucketGetOutcome::Missing => Ok(None),
            BucketGetOutcome::NotModified { etag } => {
                let mut response = ServiceResponse::new(StatusCode::NOT_MODIFIED);
                response.set_header("etag", &etag);
                Ok(Some(SourceResult {
                    response,
                    source_type: SourceType::R2,
                    content_type: None,
                    size: None,
                }))
            }
            BucketGetOutcome::RangeNotSatisfiable { size } => {
                let mut response = ServiceResponse::new(StatusCode::RANGE_NOT_SATISFIABLE);
                response.set_header("content-range", &format!("bytes */{}", size));
                Ok(Some(SourceResult {
                    response,
                    source_type: SourceType::R2,
                    content_type: None,
                    size: Some(size),
                }))
            }
            BucketGetOutcome::Found(object) => {
                let ranged = object_range.is_some();
                let status = if ranged {
                    StatusCode::PARTIAL_CONTENT
                } else {
                    StatusCode::OK
                };
                let mut response = ServiceResponse::new(status);
                apply_object_headers(
                    &mut response,
                    object.content_type.as_deref(),
                    object.body.len() as u64,
                    &object.etag,
                );
                if let Some(range) = object_range {
                    let end = range.offset + object.body.len() as u64 - 1;
                    response.set_header(
                        "content-range",
                        &format!("bytes {}-{}/{}", range.offset, end, object.size),
                    );
                }
                response.set_header("accept-ranges", "bytes");
                let content_type = object.content_type.clone();
                let size = object.size;
                response.body = Body::Full(object.body);
                Ok(Some(SourceResult {
                    response,
                    source_type: SourceType::R2,
                    content_type,
                    size: Some(size),
                }))
            }
        }
    }

    async fn fetch_http(
        &self,
        source: &ResolvedSource,
        intent: &FetchIntent,
    ) -> Result<Option<SourceResult>, SourceFailure> {
        let source_type = source.source_type();
        let path = source.path().to_string();
        let fail = |detail: String| SourceFailure {
            source_type,
            path: path.clone(),
            detail,
            not_found: false,
        };

        let plain_url = source
            .effective_url()
            .ok_or_else(|| fail("source has no url".to_string()))?;

        let mut request = HttpRequest {
            method: intent.method.clone(),
            url: plain_url.clone(),
            headers: HashMap::new(),
        };
        for (name, value) in source.headers() {
            request.headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        if let Some(range) = &intent.range {
            request.headers.insert("range".to_string(), range.clone());
        }
        if let Some(if_none_match) = &intent.if_none_match {
            request
                .headers
                .insert("if-none-match".to_string(), if_none_match.clone());
        }

        if let Some(auth) = source.auth() {
            match auth {
                AuthConfig::AwsS3PresignedUrl { .. } => {
                    request.url = signed_url_for_source(
                        source.path(),
                        &plain_url,
                        auth,
                        source_type,
                        &self.env,
                        &self.presign_cache,
                        &self.gate,
                    )
                    .await
                    .map_err(|e| fail(e.to_string()))?;
                }
                _ => {
                    request = crate::auth::apply_auth(request, auth, self.env.as_ref())
                        .map_err(|e| fail(e.to_string()))?;
                }
            }
        }

        let response = self
            .http
            .fetch(request)
            .await
            .map_err(|e| fail(e.to_string()))?;

        let status = response.status.as_u16();
        match status {
            200 | 206 | 304 => {
                let content_type = response.header_str("content-type").map(str::to_string);
                let size = response.content_length();
                Ok(Some(SourceResult {
                    response,
                    source_type,
                    content_type,
                    size,
                }))
            }
            404 => Ok(None),
            400..=499 => {
                // Reachable but the request is wrong; do not cascade.
                let content_type = response.header_str("content-type").map(str::to_string);
                let size = response.content_length();
                Ok(Some(SourceResult {
                    response,
                    source_type,
                    content_type,
                    size,
                }))
            }
            _ => Err(fail(format!("upstream returned {}", status))),
        }
    }
}

fn apply_object_headers(
    response: &mut ServiceResponse,
    content_type: Option<&str>,
    content_length: u64,
    etag: &str,
) {
    response.set_header(
        "content-type",
        content_type.unwrap_or("application/octet-stream"),
    );
    response.set_header("content-length", &content_length.to_string());
    response.set_header("etag", etag);
}
