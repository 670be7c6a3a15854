//! Video section of the worker configuration
//!
//! Carries the origin table (or legacy path patterns), derivative presets,
//! transform defaults, valid-option enumerations, storage defaults used by
//! the legacy conversion, and the CDN transform base path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::cache::CacheSettings;
use super::legacy::PathPatternConfig;
use super::origin::{AuthConfig, OriginConfig, SourceType, TransformOverrides};
use crate::constants::DEFAULT_TRANSFORM_BASE_PATH;
use crate::transform::{Fit, Mode};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VideoConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origins: Option<Vec<OriginConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_patterns: Option<Vec<PathPatternConfig>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub derivatives: HashMap<String, DerivativeConfig>,
    #[serde(default = "default_transform_defaults")]
    pub defaults: TransformOverrides,
    #[serde(default)]
    pub valid_options: ValidOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageDefaults>,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default)]
    pub passthrough: PassthroughConfig,
    /// Video-scoped cache settings; wins over the top-level `cache` section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching: Option<CacheSettings>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            origins: None,
            path_patterns: None,
            derivatives: HashMap::new(),
            defaults: default_transform_defaults(),
            valid_options: ValidOptions::default(),
            storage: None,
            base_path: default_base_path(),
            passthrough: PassthroughConfig::default(),
            caching: None,
        }
    }
}

fn default_base_path() -> String {
    DEFAULT_TRANSFORM_BASE_PATH.to_string()
}

fn default_transform_defaults() -> TransformOverrides {
    TransformOverrides {
        mode: Some(Mode::Video),
        fit: Some(Fit::Contain),
        audio: Some(true),
        ..Default::default()
    }
}

/// A named bundle of transform parameters (e.g. "mobile" = 854x640, video).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DerivativeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,
}

/// Accepted values for the free-form option fields. Modes and fits are
/// enforced by their enums and need no lists here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValidOptions {
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
    #[serde(default = "default_qualities")]
    pub qualities: Vec<String>,
    #[serde(default = "default_compressions")]
    pub compressions: Vec<String>,
    #[serde(default = "default_preloads")]
    pub preloads: Vec<String>,
}

impl Default for ValidOptions {
    fn default() -> Self {
        Self {
            formats: default_formats(),
            qualities: default_qualities(),
            compressions: default_compressions(),
            preloads: default_preloads(),
        }
    }
}

fn default_formats() -> Vec<String> {
    ["mp4", "webm", "gif", "jpg", "jpeg", "png", "webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_qualities() -> Vec<String> {
    ["low", "medium", "high", "auto"].iter().map(|s| s.to_string()).collect()
}

fn default_compressions() -> Vec<String> {
    ["low", "medium", "high", "auto"].iter().map(|s| s.to_string()).collect()
}

fn default_preloads() -> Vec<String> {
    ["none", "metadata", "auto"].iter().map(|s| s.to_string()).collect()
}

/// Global storage section used to synthesize origins from legacy path
/// patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageDefaults {
    #[serde(default = "default_storage_priority")]
    pub priority: Vec<SourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r2: Option<R2Storage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_auth: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_auth: Option<AuthConfig>,
}

fn default_storage_priority() -> Vec<SourceType> {
    vec![SourceType::R2, SourceType::Remote, SourceType::Fallback]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct R2Storage {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub bucket_binding: String,
}

fn default_true() -> bool {
    true
}

/// Paths the handler serves untransformed, straight from storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PassthroughConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
}

impl PassthroughConfig {
    /// Whether the path matches a configured passthrough pattern.
    pub fn matches(&self, path: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.patterns.iter().any(|pattern| {
            regex::Regex::new(pattern)
                .map(|re| re.is_match(path))
                .unwrap_or(false)
        })
    }
}
