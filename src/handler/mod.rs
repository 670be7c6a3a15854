//! Transform request handling
//!
//! `handle_transform` is the core entrypoint the HTTP shell calls: probe
//! the result cache, invoke the CDN transformer on a miss, store the
//! artifact in the background, and route failures through the fallback
//! pipeline. `handle_origin_fetch` is the loop-back path the transformer
//! itself uses to read origin bytes through the storage failover chain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use crate::background::BackgroundGate;
use crate::cache::{CacheKey, GetConditions, StoreRequest};
use crate::config::{CacheSettings, Config};
use crate::context::ServiceContext;
use crate::error::ServiceError;
use crate::fallback::{self, FallbackContext};
use crate::metrics::ProxyMetrics;
use crate::origins::{OriginMatch, ResolvedSource};
use crate::presign::signed_url_for_source;
use crate::request::IncomingRequest;
use crate::response::{tee_body, Body, ServiceResponse};
use crate::storage::fetcher::FetchIntent;
use crate::transform::invoker::{self, TransformError};
use crate::transform::url::{build_transform_url, generate_cache_tags};
use crate::transform::{resolve_options, ResolutionInputs, TransformOptions};

/// Handle a transformation request end to end.
pub async fn handle_transform(
    request: &IncomingRequest,
    ctx: &Arc<ServiceContext>,
) -> ServiceResponse {
    let started = Instant::now();
    let request_id = uuid::Uuid::new_v4();
    let debug = request.has_query_param("debug");
    ProxyMetrics::global().requests.inc();

    let span = tracing::info_span!(
        "handle_transform",
        request_id = %request_id,
        path = %request.path(),
    );

    let mut response = match transform_flow(request, ctx, debug).instrument(span).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, error_type = err.error_type(), "request failed");
            ServiceResponse::from_error(&err)
        }
    };

    if debug {
        response.set_header("x-video-resizer-debug", "true");
        response.set_header(
            "x-processing-time-ms",
            &started.elapsed().as_millis().to_string(),
        );
    }
    response
}

/// Loop-back origin read: the downstream transformer (and the passthrough
/// path) fetches source bytes through the storage failover chain.
pub async fn handle_origin_fetch(
    request: &IncomingRequest,
    ctx: &Arc<ServiceContext>,
) -> ServiceResponse {
    match origin_fetch_flow(request, ctx).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "origin fetch failed");
            ServiceResponse::from_error(&err)
        }
    }
}

async fn origin_fetch_flow(
    request: &IncomingRequest,
    ctx: &Arc<ServiceContext>,
) -> Result<ServiceResponse, ServiceError> {
    let path = request.path().to_string();
    let origin_match = ctx.resolver().resolve(&path, |binding| ctx.has_bucket(binding))?;
    let intent = FetchIntent::from_request(request);
    let result = ctx.storage_fetcher().fetch(&origin_match.sources, &intent).await?;
    let mut response = result.response;
    response.set_header("x-storage-source", &result.source_type.to_string());
    Ok(response)
}

async fn transform_flow(
    request: &IncomingRequest,
    ctx: &Arc<ServiceContext>,
    debug: bool,
) -> Result<ServiceResponse, ServiceError> {
    let config = ctx.snapshot();
    let settings = config.cache_settings();
    let path = request.path().to_string();

    if config.video.passthrough.matches(&path) {
        tracing::debug!(path = %path, "passthrough path, serving origin bytes");
        return origin_fetch_flow(request, ctx).await;
    }

    let caller_options = TransformOptions::from_query_pairs(&request.query_pairs())?;
    let origin_match = ctx.resolver().resolve(&path, |binding| ctx.has_bucket(binding))?;

    let derivative_config = match &caller_options.derivative {
        Some(name) => Some(config.video.derivatives.get(name).ok_or_else(|| {
            ServiceError::Validation(format!("unknown derivative '{}'", name))
        })?),
        None => None,
    };

    let options = resolve_options(
        &caller_options,
        &ResolutionInputs {
            defaults: Some(&config.video.defaults),
            pattern_overrides: None,
            origin_overrides: origin_match.origin.transform_options.as_ref(),
            origin_quality: origin_match.origin.quality.as_deref(),
            origin_compression: origin_match.origin.video_compression.as_deref(),
            derivative: derivative_config,
        },
    );
    options.validate(&config.video.valid_options)?;

    let bypass = debug
        || request
            .query_pairs()
            .iter()
            .any(|(name, _)| settings.is_bypass_param(name));

    let cache_version = match request.query_param("v").and_then(|v| v.parse().ok()) {
        Some(version) => version,
        None => match ctx.version_store() {
            Some(store) => store.current(&path).await,
            None => 1,
        },
    };

    let cache_key = CacheKey::from_options(&path, &options);
    let metrics = ProxyMetrics::global();

    if bypass {
        metrics.cache_probes.with_label_values(&["bypass"]).inc();
    } else {
        let conditions = GetConditions {
            range: request.header_str("range").map(str::to_string),
            if_none_match: request.header_str("if-none-match").map(str::to_string),
            cache_version,
        };
        match ctx.result_cache().get(&cache_key, &conditions).await {
            Ok(Some(hit)) => {
                metrics.cache_probes.with_label_values(&["hit"]).inc();
                tracing::debug!(key = %cache_key, "result cache hit");
                let mut response = hit.response;
                response.set_header("x-cache", "HIT");
                if hit.revalidate {
                    schedule_revalidation(ctx, request, &options, cache_version);
                }
                return Ok(response);
            }
            Ok(None) => {
                metrics.cache_probes.with_label_values(&["miss"]).inc();
            }
            Err(err) => {
                // Cache failures degrade to a miss, never fail the request.
                metrics.cache_probes.with_label_values(&["miss"]).inc();
                tracing::warn!(key = %cache_key, error = %err, "cache probe failed");
            }
        }
    }

    invoke_transform_pipeline(
        ctx,
        request,
        &config,
        &settings,
        &origin_match,
        options,
        cache_version,
        bypass,
    )
    .await
}

/// Invoke the transformer, with at most one duration-adjusting retry, then
/// serve-and-store or enter the fallback pipeline.
#[allow(clippy::too_many_arguments)]
async fn invoke_transform_pipeline(
    ctx: &Arc<ServiceContext>,
    request: &IncomingRequest,
    config: &Config,
    settings: &CacheSettings,
    origin_match: &OriginMatch,
    options: TransformOptions,
    cache_version: u32,
    bypass: bool,
) -> Result<ServiceResponse, ServiceError> {
    let metrics = ProxyMetrics::global();
    let effective_url = effective_source_url(ctx, request, origin_match).await?;
    let mut passthrough_headers = HashMap::new();
    if let Some(range) = request.header_str("range") {
        passthrough_headers.insert("range".to_string(), range.to_string());
    }
    if let Some(if_none_match) = request.header_str("if-none-match") {
        passthrough_headers.insert("if-none-match".to_string(), if_none_match.to_string());
    }

    let mut options = options;
    let mut adjusted_duration: Option<String> = None;
    let mut retried = false;

    loop {
        let transform_url = build_transform_url(
            request.origin(),
            &config.video.base_path,
            &options,
            &effective_url,
            cache_version,
        );
        tracing::debug!(url = %transform_url, "invoking transformer");

        match invoker::invoke(ctx.http.as_ref(), &transform_url, &passthrough_headers).await {
            Ok(response) => {
                metrics.transform_invocations.with_label_values(&["ok"]).inc();
                let mut response = serve_and_store(
                    ctx,
                    request,
                    settings,
                    origin_match,
                    &options,
                    cache_version,
                    bypass,
                    response,
                );
                if let Some(duration) = &adjusted_duration {
                    response.set_header("x-transform-duration-adjusted", duration);
                }
                return Ok(response);
            }
            Err(TransformError::DurationLimit { limit_seconds, .. })
                if !retried && duration_exceeds(&options, limit_seconds) =>
            {
                metrics.transform_invocations.with_label_values(&["error"]).inc();
                metrics.duration_retries.inc();
                let limit = format_seconds(limit_seconds);
                tracing::info!(limit = %limit, "duration over transformer limit, retrying once");
                options.duration = Some(limit.clone());
                adjusted_duration = Some(limit);
                retried = true;
                // The adjusted duration changes the cache key too.
                continue;
            }
            Err(error) => {
                metrics.transform_invocations.with_label_values(&["error"]).inc();
                return Ok(fallback::handle(
                    error,
                    FallbackContext {
                        ctx,
                        request,
                        options: &options,
                        origin_match,
                        fallback_origin_url: None,
                        settings,
                        bypass,
                        cache_version,
                    },
                )
                .await);
            }
        }
    }
}

/// The URL the transformer will fetch the source bytes from. r2 sources
/// loop back through this worker; HTTP sources are reached directly, with
/// presigned query auth when the source is signed that way.
async fn effective_source_url(
    ctx: &Arc<ServiceContext>,
    request: &IncomingRequest,
    origin_match: &OriginMatch,
) -> Result<String, ServiceError> {
    let source = origin_match
        .sources
        .first()
        .ok_or_else(|| ServiceError::NotFound("no eligible sources".to_string()))?;

    match source {
        ResolvedSource::R2 { .. } => Ok(format!("{}{}", request.origin(), request.path())),
        ResolvedSource::Remote { auth, path, .. } | ResolvedSource::Fallback { auth, path, .. } => {
            let plain = source
                .effective_url()
                .ok_or_else(|| ServiceError::Unknown("http source without url".to_string()))?;
            match auth {
                Some(auth) if auth.enabled() => match auth {
                    crate::config::AuthConfig::AwsS3PresignedUrl { .. } => {
                        signed_url_for_source(
                            path,
                            &plain,
                            auth,
                            source.source_type(),
                            &ctx.env,
                            &ctx.presign_cache(),
                            &ctx.gate,
                        )
                        .await
                    }
                    crate::config::AuthConfig::Query { .. } => {
                        let signed = crate::auth::apply_auth(
                            crate::storage::HttpRequest::get(&plain),
                            auth,
                            ctx.env.as_ref(),
                        )?;
                        Ok(signed.url)
                    }
                    // Header-style schemes cannot ride in a URL; the
                    // transformer's loop-back fetch applies them instead.
                    _ => Ok(plain),
                },
                _ => Ok(plain),
            }
        }
    }
}

/// Annotate the successful transform response for the client and schedule
/// the cache write off the hot path. The client stream starts immediately;
/// the cache copy fills as the client consumes.
#[allow(clippy::too_many_arguments)]
fn serve_and_store(
    ctx: &Arc<ServiceContext>,
    request: &IncomingRequest,
    settings: &CacheSettings,
    origin_match: &OriginMatch,
    options: &TransformOptions,
    cache_version: u32,
    bypass: bool,
    mut response: ServiceResponse,
) -> ServiceResponse {
    let path = request.path().to_string();
    let normalized = crate::cache::key::normalize_path(&path);
    let ttl_seconds = origin_match
        .origin
        .ttl
        .map(|ttl| ttl.ok)
        .unwrap_or_else(|| settings.ttl_for_path(&normalized).ok);
    let cache_tags = generate_cache_tags(&path, options);

    response.set_header("accept-ranges", "bytes");
    if response.header_str("etag").is_none() {
        let base_key = CacheKey::from_options(&path, options).to_string();
        response.set_header("etag", &crate::cache::stable_etag(&base_key, cache_version));
    }
    if !cache_tags.is_empty() {
        response.set_header("cache-tag", &cache_tags.join(","));
    }
    if bypass {
        response.set_header("cache-control", "no-store");
    } else {
        response.set_header("cache-control", &format!("public, max-age={}", ttl_seconds));
    }
    response.set_header("x-cache", "MISS");

    let cacheable = !bypass
        && response.status.as_u16() == 200
        && origin_match.origin.cacheability.unwrap_or(true)
        && settings.cacheable_path(&normalized);
    if !cacheable {
        return response;
    }

    let body = std::mem::replace(&mut response.body, Body::Empty);
    let (client_body, copy) = tee_body(body);
    response.body = client_body;

    let store = StoreRequest {
        key: CacheKey::from_options(&path, options),
        source_path: path,
        options: options.clone(),
        content_type: response
            .header_str("content-type")
            .unwrap_or("application/octet-stream")
            .to_string(),
        etag: response.header_str("etag").map(str::to_string),
        cache_tags,
        ttl_seconds: Some(ttl_seconds),
        cache_version,
        content_length_hint: response.content_length(),
        body: copy,
    };
    let cache = ctx.result_cache();
    let accepted = ctx.gate.spawn(
        "transform-cache-store",
        Box::pin(async move {
            cache.store(store).await.map_err(ServiceError::from)?;
            Ok(())
        }),
    );
    if !accepted {
        tracing::debug!("no background facility, transform result not cached");
    }
    response
}

/// Refresh-on-read: re-run the transform and store the fresh artifact in
/// the background while the stale-but-valid bytes are being served.
fn schedule_revalidation(
    ctx: &Arc<ServiceContext>,
    request: &IncomingRequest,
    options: &TransformOptions,
    cache_version: u32,
) {
    let gate = Arc::clone(&ctx.gate);
    let ctx = Arc::clone(ctx);
    let request_origin = request.origin().to_string();
    let path = request.path().to_string();
    let options = options.clone();

    let accepted = gate.spawn(
        "cache-revalidate",
        Box::pin(async move {
            revalidate(ctx, request_origin, path, options, cache_version).await
        }),
    );
    if !accepted {
        tracing::debug!("no background facility, revalidation skipped");
    }
}

async fn revalidate(
    ctx: Arc<ServiceContext>,
    request_origin: String,
    path: String,
    options: TransformOptions,
    cache_version: u32,
) -> Result<(), ServiceError> {
    let config = ctx.snapshot();
    let settings = config.cache_settings();
    let origin_match = ctx
        .resolver()
        .resolve(&path, |binding| ctx.has_bucket(binding))?;

    let synthetic = IncomingRequest::get(format!("{}{}", request_origin, path));
    let effective_url = effective_source_url(&ctx, &synthetic, &origin_match).await?;
    let transform_url = build_transform_url(
        &request_origin,
        &config.video.base_path,
        &options,
        &effective_url,
        cache_version,
    );

    let response = invoker::invoke(ctx.http.as_ref(), &transform_url, &HashMap::new())
        .await
        .map_err(|e| ServiceError::TransformationFailed(e.summary()))?;

    let normalized = crate::cache::key::normalize_path(&path);
    let ttl_seconds = origin_match
        .origin
        .ttl
        .map(|ttl| ttl.ok)
        .unwrap_or_else(|| settings.ttl_for_path(&normalized).ok);

    let store = StoreRequest {
        key: CacheKey::from_options(&path, &options),
        source_path: path.clone(),
        content_type: response
            .header_str("content-type")
            .unwrap_or("application/octet-stream")
            .to_string(),
        etag: response.header_str("etag").map(str::to_string),
        cache_tags: generate_cache_tags(&path, &options),
        ttl_seconds: Some(ttl_seconds),
        cache_version,
        content_length_hint: response.content_length(),
        body: response.body,
        options,
    };
    ctx.result_cache()
        .store(store)
        .await
        .map_err(ServiceError::from)?;
    tracing::debug!(path = %path, "revalidation stored fresh artifact");
    Ok(())
}

fn duration_exceeds(options: &TransformOptions, limit_seconds: f64) -> bool {
    match options.duration.as_deref().and_then(parse_duration_seconds) {
        Some(requested) => requested > limit_seconds,
        None => false,
    }
}

/// Parse `"30s"`, `"30"`, or `"0.5s"` into seconds.
fn parse_duration_seconds(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('s').parse().ok()
}

fn format_seconds(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}s", value as u64)
    } else {
        format!("{}s", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration_seconds("60s"), Some(60.0));
        assert_eq!(parse_duration_seconds("29.5s"), Some(29.5));
        assert_eq!(parse_duration_seconds("45"), Some(45.0));
        assert_eq!(parse_duration_seconds("soon"), None);
    }

    #[test]
    fn test_duration_exceeds() {
        let options = TransformOptions {
            duration: Some("60s".to_string()),
            ..Default::default()
        };
        assert!(duration_exceeds(&options, 30.0));
        assert!(!duration_exceeds(&options, 60.0));
        assert!(!duration_exceeds(&TransformOptions::default(), 30.0));
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(30.0), "30s");
        assert_eq!(format_seconds(29.5), "29.5s");
    }
}
