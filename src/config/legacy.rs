//! Legacy path-pattern configuration
//!
//! Older deployments declare flat `pathPatterns` plus a global storage
//! section instead of an origin table. The conversion into origins is
//! deterministic and happens once, at load time.

use serde::{Deserialize, Serialize};

use super::origin::{OriginConfig, SourceConfig, SourceType, TransformOverrides, TtlConfig};
use super::video::StorageDefaults;
use crate::error::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PathPatternConfig {
    pub name: String,
    pub matcher: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capture_groups: Vec<String>,
    /// Per-pattern remote origin, overriding the storage default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<TtlConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacheability: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation_overrides: Option<TransformOverrides>,
}

/// Convert legacy path patterns into a synthesized origin list.
///
/// Sources are emitted in the storage section's priority order; a source
/// type is emitted only when its resources are configured. Patterns with no
/// usable source at all are a configuration error, surfaced at load.
pub fn synthesize_origins(
    patterns: &[PathPatternConfig],
    storage: Option<&StorageDefaults>,
) -> Result<Vec<OriginConfig>, ServiceError> {
    let mut origins = Vec::with_capacity(patterns.len());

    for pattern in patterns {
        let mut sources = Vec::new();
        let priority_order = storage
            .map(|s| s.priority.clone())
            .unwrap_or_else(|| vec![SourceType::R2, SourceType::Remote, SourceType::Fallback]);

        for (index, source_type) in priority_order.iter().enumerate() {
            let priority = index as i32;
            match source_type {
                SourceType::R2 => {
                    if let Some(r2) = storage.and_then(|s| s.r2.as_ref()) {
                        if r2.enabled {
                            sources.push(SourceConfig::R2 {
                                priority,
                                path: "${0}".to_string(),
                                bucket_binding: r2.bucket_binding.clone(),
                                headers: Default::default(),
                                cache_control: None,
                            });
                        }
                    }
                }
                SourceType::Remote => {
                    let url = pattern
                        .origin_url
                        .clone()
                        .or_else(|| storage.and_then(|s| s.remote_url.clone()));
                    if let Some(url) = url {
                        sources.push(SourceConfig::Remote {
                            priority,
                            path: "${0}".to_string(),
                            url,
                            auth: storage.and_then(|s| s.remote_auth.clone()),
                            headers: Default::default(),
                            cache_control: None,
                        });
                    }
                }
                SourceType::Fallback => {
                    if let Some(url) = storage.and_then(|s| s.fallback_url.clone()) {
                        sources.push(SourceConfig::Fallback {
                            priority,
                            path: "${0}".to_string(),
                            url,
                            auth: storage.and_then(|s| s.fallback_auth.clone()),
                            headers: Default::default(),
                            cache_control: None,
                        });
                    }
                }
            }
        }

        if sources.is_empty() {
            return Err(ServiceError::Configuration(format!(
                "path pattern '{}' has no usable storage source",
                pattern.name
            )));
        }

        origins.push(OriginConfig {
            name: pattern.name.clone(),
            matcher: pattern.matcher.clone(),
            capture_groups: pattern.capture_groups.clone(),
            sources,
            ttl: pattern.ttl,
            cacheability: pattern.cacheability,
            video_compression: pattern.video_compression.clone(),
            quality: pattern.quality.clone(),
            transform_options: pattern.transformation_overrides.clone(),
        });
    }

    Ok(origins)
}
