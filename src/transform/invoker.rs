//! Transform invocation and response classification
//!
//! Builds nothing itself; the URL comes from `transform::url`. The invoker
//! fetches the CDN transformer endpoint and classifies non-success
//! responses into the shapes the fallback pipeline dispatches on. Error
//! bodies are read bounded; success bodies stay streaming.

use std::collections::HashMap;

use http::Method;

use crate::response::{Body, ServiceResponse};
use crate::storage::{HttpFetch, HttpRequest};

/// Largest error body we bother reading for classification.
const ERROR_BODY_LIMIT: usize = 16 * 1024;

/// Classified transform failure.
#[derive(Debug, Clone)]
pub enum TransformError {
    /// 400 with a "duration" body naming a numeric limit.
    DurationLimit { limit_seconds: f64, raw: String },
    /// 400/413 with a "file size" body.
    FileSize { status: u16, raw: String },
    InvalidDimension { raw: String },
    InvalidFormat { raw: String },
    /// 502/504 from the transformer, or transport failure reaching it.
    OriginUnavailable { status: u16 },
    /// Other 5xx and unclassified 4xx.
    TransformationFailed { status: u16, raw: String },
}

impl TransformError {
    /// Stable name surfaced in `X-Original-Error-Type`.
    pub fn classification(&self) -> &'static str {
        match self {
            TransformError::DurationLimit { .. } => "DurationLimitError",
            TransformError::FileSize { .. } => "FileSizeError",
            TransformError::InvalidDimension { .. } => "InvalidDimension",
            TransformError::InvalidFormat { .. } => "InvalidFormat",
            TransformError::OriginUnavailable { .. } => "OriginUnavailable",
            TransformError::TransformationFailed { .. } => "TransformationFailed",
        }
    }

    /// Original status code surfaced in `X-Original-Status-Code`.
    pub fn status(&self) -> u16 {
        match self {
            TransformError::DurationLimit { .. } => 400,
            TransformError::FileSize { status, .. } => *status,
            TransformError::InvalidDimension { .. } | TransformError::InvalidFormat { .. } => 400,
            TransformError::OriginUnavailable { status } => *status,
            TransformError::TransformationFailed { status, .. } => *status,
        }
    }

    /// Short human-readable summary for `X-Fallback-Reason`.
    pub fn summary(&self) -> String {
        match self {
            TransformError::DurationLimit { limit_seconds, .. } => {
                format!("duration exceeds transformer limit of {}s", limit_seconds)
            }
            TransformError::FileSize { status, .. } => {
                format!("file size rejected by transformer ({})", status)
            }
            TransformError::InvalidDimension { .. } => "invalid dimensions".to_string(),
            TransformError::InvalidFormat { .. } => "invalid format".to_string(),
            TransformError::OriginUnavailable { status } => {
                format!("transformer origin unavailable ({})", status)
            }
            TransformError::TransformationFailed { status, .. } => {
                format!("transformation failed ({})", status)
            }
        }
    }

    /// Whether the fallback pipeline may attempt a direct-origin fetch.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            TransformError::FileSize { .. }
                | TransformError::OriginUnavailable { .. }
                | TransformError::TransformationFailed { .. }
        )
    }
}

/// Fetch the transform URL and classify the outcome. Pass-through request
/// headers (`Range`, `If-None-Match`) ride along untouched.
pub async fn invoke(
    http: &dyn HttpFetch,
    transform_url: &str,
    passthrough_headers: &HashMap<String, String>,
) -> Result<ServiceResponse, TransformError> {
    let mut request = HttpRequest {
        method: Method::GET,
        url: transform_url.to_string(),
        headers: passthrough_headers.clone(),
    };
    request
        .headers
        .entry("accept".to_string())
        .or_insert_with(|| "video/*,image/*,*/*".to_string());

    let response = match http.fetch(request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(url = %transform_url, error = %err, "transformer unreachable");
            return Err(TransformError::OriginUnavailable { status: 502 });
        }
    };

    classify(response).await
}

/// Classify a transformer response. Success passes through with its body
/// untouched; failures consume a bounded prefix of the body.
pub async fn classify(response: ServiceResponse) -> Result<ServiceResponse, TransformError> {
    let status = response.status.as_u16();
    match status {
        200 | 206 | 304 => Ok(response),
        502 | 504 => Err(TransformError::OriginUnavailable { status }),
        400 => {
            let raw = read_error_body(response).await;
            let lowered = raw.to_lowercase();
            if lowered.contains("duration") {
                if let Some(limit_seconds) = extract_duration_limit(&raw) {
                    return Err(TransformError::DurationLimit { limit_seconds, raw });
                }
            }
            if lowered.contains("file size") {
                return Err(TransformError::FileSize { status, raw });
            }
            if lowered.contains("dimension") || lowered.contains("width") || lowered.contains("height")
            {
                return Err(TransformError::InvalidDimension { raw });
            }
            if lowered.contains("format") {
                return Err(TransformError::InvalidFormat { raw });
            }
            Err(TransformError::TransformationFailed { status, raw })
        }
        413 => {
            let raw = read_error_body(response).await;
            Err(TransformError::FileSize { status, raw })
        }
        _ => {
            let raw = read_error_body(response).await;
            Err(TransformError::TransformationFailed { status, raw })
        }
    }
}

async fn read_error_body(response: ServiceResponse) -> String {
    match response.body.collect().await {
        Ok(bytes) => {
            let truncated = &bytes[..bytes.len().min(ERROR_BODY_LIMIT)];
            String::from_utf8_lossy(truncated).into_owned()
        }
        Err(_) => String::new(),
    }
}

/// Pull the numeric limit out of bodies like "maximum duration is 30s".
fn extract_duration_limit(body: &str) -> Option<f64> {
    let re = regex::Regex::new(r"(?i)duration[^0-9]*([0-9]+(?:\.[0-9]+)?)\s*s?").ok()?;
    re.captures(body)?.get(1)?.as_str().parse().ok()
}
