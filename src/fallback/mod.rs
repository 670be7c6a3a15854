//! Error and fallback pipeline
//!
//! When a transformation fails, the pipeline decides between serving the
//! original bytes directly from the origin, retrying through the full
//! storage failover chain, or surfacing a structured error. Fallback
//! responses are annotated with `X-Fallback-*` headers and marked
//! `no-store` so intermediaries never cache them; the bytes themselves may
//! still be streamed into the result cache in the background when small
//! enough. A 404 from the transformer is deliberately NOT handled here:
//! alternative-origin rematching belongs to the shell.

use std::sync::Arc;

use crate::background::BackgroundGate;
use crate::cache::{CacheKey, StoreRequest};
use crate::config::CacheSettings;
use crate::context::ServiceContext;
use crate::error::ServiceError;
use crate::metrics::ProxyMetrics;
use crate::origins::OriginMatch;
use crate::request::IncomingRequest;
use crate::response::{tee_body, Body, ServiceResponse};
use crate::storage::fetcher::FetchIntent;
use crate::storage::{HttpFetch, HttpRequest};
use crate::transform::invoker::TransformError;
use crate::transform::url::generate_cache_tags;
use crate::transform::TransformOptions;

pub struct FallbackContext<'a> {
    pub ctx: &'a Arc<ServiceContext>,
    pub request: &'a IncomingRequest,
    pub options: &'a TransformOptions,
    pub origin_match: &'a OriginMatch,
    /// Explicit override computed upstream, when one exists.
    pub fallback_origin_url: Option<String>,
    pub settings: &'a CacheSettings,
    pub bypass: bool,
    pub cache_version: u32,
}

/// Run the decision tree for a classified transform failure. Duration-limit
/// retries happen in the handler before this point; everything arriving
/// here either falls back or surfaces the error.
pub async fn handle(error: TransformError, fctx: FallbackContext<'_>) -> ServiceResponse {
    // 404 is rematch territory for the shell, never a fallback.
    if error.status() == 404 {
        return error_document(&error);
    }
    if !error.is_fallback_eligible() {
        return error_document(&error);
    }

    tracing::info!(
        error_type = error.classification(),
        status = error.status(),
        path = %fctx.request.path(),
        "transform failed, attempting fallback"
    );

    // Step 2: direct origin fetch.
    if let Some(mut response) = try_direct_origin(&fctx).await {
        annotate_fallback(&mut response, &error);
        maybe_cache_fallback(&fctx, &mut response);
        ProxyMetrics::global().fallbacks.with_label_values(&["direct"]).inc();
        return response;
    }

    // Step 3: full storage failover pass.
    let intent = FetchIntent::from_request(fctx.request);
    match fctx
        .ctx
        .storage_fetcher()
        .fetch(&fctx.origin_match.sources, &intent)
        .await
    {
        Ok(result) if result.response.is_success() => {
            let mut response = result.response;
            annotate_fallback(&mut response, &error);
            response.set_header("x-storage-source", &result.source_type.to_string());
            maybe_cache_fallback(&fctx, &mut response);
            ProxyMetrics::global().fallbacks.with_label_values(&["storage"]).inc();
            response
        }
        Ok(result) => {
            tracing::warn!(
                status = result.response.status.as_u16(),
                "storage fallback returned non-success"
            );
            error_document(&error)
        }
        Err(storage_error) => {
            tracing::warn!(error = %storage_error, "storage fallback failed");
            error_document(&error)
        }
    }
}

/// Direct origin fetch: the explicit fallback URL if present, else the
/// chosen source's URL when it is a usable HTTP(S) URL. Returns `None` when
/// no URL exists or the fetch did not succeed.
async fn try_direct_origin(fctx: &FallbackContext<'_>) -> Option<ServiceResponse> {
    let first_source = fctx.origin_match.sources.first();
    let url = fctx
        .fallback_origin_url
        .clone()
        .or_else(|| first_source.and_then(|source| source.effective_url()))?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return None;
    }

    let mut request = HttpRequest::get(&url);
    if let Some(range) = fctx.request.header_str("range") {
        request = request.with_header("range", range);
    }
    if let Some(if_none_match) = fctx.request.header_str("if-none-match") {
        request = request.with_header("if-none-match", if_none_match);
    }
    if let Some(source) = first_source {
        for (name, value) in source.headers() {
            request = request.with_header(name, value);
        }
        if let Some(auth) = source.auth() {
            request = match crate::auth::apply_auth(request, auth, fctx.ctx.env.as_ref()) {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(error = %err, "direct origin auth failed");
                    return None;
                }
            };
        }
    }

    match fctx.ctx.http.fetch(request).await {
        Ok(response) if response.is_success() => {
            tracing::info!(url = %url, status = response.status.as_u16(), "direct origin fallback succeeded");
            Some(response)
        }
        Ok(response) => {
            tracing::warn!(url = %url, status = response.status.as_u16(), "direct origin fallback rejected");
            None
        }
        Err(err) => {
            tracing::warn!(url = %url, error = %err, "direct origin fallback unreachable");
            None
        }
    }
}

/// The `X-Fallback-*` annotation contract. Content headers from the origin
/// are preserved; intermediaries must not cache the fallback.
fn annotate_fallback(response: &mut ServiceResponse, error: &TransformError) {
    response.set_header("x-fallback-applied", "true");
    response.set_header("x-fallback-reason", &error.summary());
    response.set_header("x-original-error-type", error.classification());
    response.set_header("x-original-status-code", &error.status().to_string());
    response.set_header("cache-control", "no-store");
}

/// Tee the fallback body into the result cache when it is small enough and
/// a background facility exists. The client sees bytes immediately either
/// way.
fn maybe_cache_fallback(fctx: &FallbackContext<'_>, response: &mut ServiceResponse) {
    if fctx.bypass {
        return;
    }
    let size_hint = response.content_length();
    if let Some(size) = size_hint {
        if size > fctx.settings.fallback_cache_max_bytes {
            tracing::debug!(size, limit = fctx.settings.fallback_cache_max_bytes, "fallback body too large to cache");
            return;
        }
    }
    if response.status.as_u16() != 200 {
        // Partial or conditional fallback bodies are not cacheable artifacts.
        return;
    }

    let body = std::mem::replace(&mut response.body, Body::Empty);
    let (client_body, copy) = tee_body(body);
    response.body = client_body;

    let source_path = fctx.request.path().to_string();
    let store = StoreRequest {
        key: CacheKey::from_options(&source_path, fctx.options),
        source_path: source_path.clone(),
        options: fctx.options.clone(),
        content_type: response
            .header_str("content-type")
            .unwrap_or("application/octet-stream")
            .to_string(),
        etag: response.header_str("etag").map(str::to_string),
        cache_tags: generate_cache_tags(&source_path, fctx.options),
        ttl_seconds: None,
        cache_version: fctx.cache_version,
        content_length_hint: size_hint,
        body: copy,
    };
    let cache = fctx.ctx.result_cache();
    let accepted = fctx.ctx.gate.spawn(
        "fallback-cache-store",
        Box::pin(async move {
            cache.store(store).await.map_err(ServiceError::from)?;
            Ok(())
        }),
    );
    if !accepted {
        tracing::debug!("no background facility, fallback bytes not cached");
    }
}

fn error_document(error: &TransformError) -> ServiceResponse {
    ServiceResponse::from_error(&to_service_error(error))
}

fn to_service_error(error: &TransformError) -> ServiceError {
    match error {
        TransformError::DurationLimit { .. }
        | TransformError::InvalidDimension { .. }
        | TransformError::InvalidFormat { .. } => ServiceError::Validation(error.summary()),
        TransformError::OriginUnavailable { .. } => {
            ServiceError::OriginUnavailable(error.summary())
        }
        TransformError::TransformationFailed { status: 404, .. } => {
            ServiceError::NotFound(error.summary())
        }
        TransformError::FileSize { .. } | TransformError::TransformationFailed { .. } => {
            ServiceError::TransformationFailed(error.summary())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_matches_taxonomy() {
        assert_eq!(
            to_service_error(&TransformError::InvalidDimension { raw: String::new() })
                .status_code(),
            400
        );
        assert_eq!(
            to_service_error(&TransformError::OriginUnavailable { status: 504 }).status_code(),
            502
        );
        assert_eq!(
            to_service_error(&TransformError::TransformationFailed {
                status: 404,
                raw: String::new()
            })
            .status_code(),
            404
        );
    }

    #[test]
    fn test_annotation_headers() {
        let mut response = ServiceResponse::new(http::StatusCode::OK);
        response.set_header("content-type", "video/mp4");
        annotate_fallback(
            &mut response,
            &TransformError::TransformationFailed {
                status: 500,
                raw: "boom".to_string(),
            },
        );
        assert_eq!(response.header_str("x-fallback-applied"), Some("true"));
        assert_eq!(
            response.header_str("x-original-error-type"),
            Some("TransformationFailed")
        );
        assert_eq!(response.header_str("x-original-status-code"), Some("500"));
        assert_eq!(response.header_str("cache-control"), Some("no-store"));
        assert_eq!(
            response.header_str("content-type"),
            Some("video/mp4"),
            "content headers are preserved"
        );
    }
}
