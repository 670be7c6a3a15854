//! Cache entry metadata
//!
//! Every stored artifact carries a JSON metadata sidecar in KV. Chunked
//! entries keep the layout description here; the manifest value itself is
//! empty.

use serde::{Deserialize, Serialize};

use crate::config::RefreshSettings;
use crate::transform::TransformOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryMetadata {
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivative: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    pub content_type: String,
    pub content_length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub cache_tags: Vec<String>,

    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds; absent entries never expire by time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Cache version at write time; older than current means invalidated.
    #[serde(default = "default_version")]
    pub cache_version: u32,

    #[serde(default)]
    pub is_chunked: bool,
    pub actual_total_video_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,

    /// Opaque per-option bag: original requested dimensions before
    /// derivative substitution, source-type hint, and similar diagnostics.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub custom_data: serde_json::Map<String, serde_json::Value>,
}

fn default_version() -> u32 {
    1
}

impl CacheEntryMetadata {
    /// Seed metadata from the resolved options of the storing request.
    pub fn from_options(source_path: &str, options: &TransformOptions) -> Self {
        let mut custom_data = serde_json::Map::new();
        if options.derivative.is_some() {
            if let Some(width) = options.width {
                custom_data.insert("requestedWidth".to_string(), width.into());
            }
            if let Some(height) = options.height {
                custom_data.insert("requestedHeight".to_string(), height.into());
            }
        }
        Self {
            source_path: source_path.to_string(),
            derivative: options.derivative.clone(),
            width: options.width,
            height: options.height,
            format: options.format.clone(),
            quality: options.quality.clone(),
            mode: options.mode.map(|m| m.to_string()),
            duration: options.duration.clone(),
            time: options.time.clone(),
            custom_data,
            ..Default::default()
        }
    }

    /// Whether the entry is still valid at `now_ms`.
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => now_ms < expires_at,
            None => true,
        }
    }

    /// Seconds of TTL remaining; `None` for entries without an expiry.
    pub fn remaining_ttl_seconds(&self, now_ms: i64) -> Option<u64> {
        self.expires_at
            .map(|expires_at| ((expires_at - now_ms).max(0) / 1000) as u64)
    }

    /// Share of the TTL already consumed, 0..=100.
    pub fn elapsed_percent(&self, now_ms: i64) -> Option<f64> {
        let expires_at = self.expires_at?;
        let total = expires_at - self.created_at;
        if total <= 0 {
            return Some(100.0);
        }
        let elapsed = (now_ms - self.created_at).clamp(0, total);
        Some(elapsed as f64 * 100.0 / total as f64)
    }

    /// Refresh-on-read: both thresholds must hold.
    pub fn needs_refresh(&self, settings: &RefreshSettings, now_ms: i64) -> bool {
        let Some(elapsed) = self.elapsed_percent(now_ms) else {
            return false;
        };
        let Some(remaining) = self.remaining_ttl_seconds(now_ms) else {
            return false;
        };
        elapsed >= settings.min_elapsed_percent && remaining < settings.min_remaining_seconds
    }
}
