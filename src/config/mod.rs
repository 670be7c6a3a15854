//! Worker configuration
//!
//! The configuration is a tagged document with `video`, `cache`, `logging`,
//! and `debug` sections, loaded once at startup, validated, and then
//! immutable for the process lifetime. Partial updates merge section-wise
//! and re-validate against the full schema before taking effect.

pub mod cache;
pub mod legacy;
pub mod origin;
pub mod store;
pub mod video;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use cache::{CacheProfile, CacheSettings, RefreshSettings};
pub use legacy::PathPatternConfig;
pub use origin::{
    AuthConfig, CacheControlConfig, OriginConfig, SourceConfig, SourceType, TransformOverrides,
    TtlConfig,
};
pub use store::ConfigStore;
pub use video::{
    DerivativeConfig, PassthroughConfig, R2Storage, StorageDefaults, ValidOptions, VideoConfig,
};

use crate::error::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub video: VideoConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSettings>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

impl Config {
    /// Parse a YAML document, run the legacy conversion, and validate.
    pub fn from_yaml_str(input: &str) -> Result<Self, ServiceError> {
        let config: Config = serde_yaml::from_str(input)
            .map_err(|e| ServiceError::Configuration(e.to_string()))?;
        config.finalize()
    }

    /// Parse a JSON document (the `worker-config` KV form), run the legacy
    /// conversion, and validate.
    pub fn from_json_str(input: &str) -> Result<Self, ServiceError> {
        let config: Config = serde_json::from_str(input)
            .map_err(|e| ServiceError::Configuration(e.to_string()))?;
        config.finalize()
    }

    /// Load the JSON document stored under the `worker-config` KV key.
    pub async fn from_kv(kv: &dyn crate::storage::KvStore) -> Result<Self, ServiceError> {
        use crate::constants::CONFIG_KV_KEY;

        let entry = kv
            .get(CONFIG_KV_KEY)
            .await
            .map_err(|e| ServiceError::Configuration(e.to_string()))?
            .ok_or_else(|| {
                ServiceError::Configuration(format!("KV key '{}' not found", CONFIG_KV_KEY))
            })?;
        let raw = std::str::from_utf8(&entry.value).map_err(|e| {
            ServiceError::Configuration(format!("configuration document is not UTF-8: {}", e))
        })?;
        Self::from_json_str(raw)
    }

    /// Load from a file, dispatching on the extension.
    pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    /// One-shot legacy conversion followed by full validation.
    fn finalize(mut self) -> Result<Self, ServiceError> {
        if self.video.origins.is_none() {
            if let Some(patterns) = &self.video.path_patterns {
                let synthesized =
                    legacy::synthesize_origins(patterns, self.video.storage.as_ref())?;
                self.video.origins = Some(synthesized);
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the full schema. Any violation aborts the load.
    pub fn validate(&self) -> Result<(), ServiceError> {
        let origins = match &self.video.origins {
            Some(origins) => origins,
            None => {
                return Err(ServiceError::Configuration(
                    "either video.origins or video.pathPatterns must be present".to_string(),
                ))
            }
        };

        let mut seen_names = std::collections::HashSet::new();
        for origin in origins {
            if origin.name.is_empty() {
                return Err(ServiceError::Configuration(
                    "origin name cannot be empty".to_string(),
                ));
            }
            if !seen_names.insert(&origin.name) {
                return Err(ServiceError::Configuration(format!(
                    "duplicate origin name '{}'",
                    origin.name
                )));
            }
            regex::Regex::new(&origin.matcher).map_err(|e| {
                ServiceError::Configuration(format!(
                    "origin '{}' matcher is not a valid regex: {}",
                    origin.name, e
                ))
            })?;
            if origin.sources.is_empty() {
                return Err(ServiceError::Configuration(format!(
                    "origin '{}' must declare at least one source",
                    origin.name
                )));
            }
            for source in &origin.sources {
                validate_source(&origin.name, source)?;
            }
        }

        let settings = self.cache_settings();
        if settings.method != "kv" {
            return Err(ServiceError::Configuration(format!(
                "unsupported cache method '{}'",
                settings.method
            )));
        }
        for profile in &settings.profiles {
            regex::Regex::new(&profile.pattern).map_err(|e| {
                ServiceError::Configuration(format!(
                    "cache profile pattern '{}' is not a valid regex: {}",
                    profile.pattern, e
                ))
            })?;
        }
        if !(0.0..=100.0).contains(&settings.refresh.min_elapsed_percent) {
            return Err(ServiceError::Configuration(
                "refresh.minElapsedPercent must be between 0 and 100".to_string(),
            ));
        }
        if settings.chunk_size_bytes == 0 {
            return Err(ServiceError::Configuration(
                "chunkSizeBytes must be positive".to_string(),
            ));
        }

        for pattern in &self.video.passthrough.patterns {
            regex::Regex::new(pattern).map_err(|e| {
                ServiceError::Configuration(format!(
                    "passthrough pattern '{}' is not a valid regex: {}",
                    pattern, e
                ))
            })?;
        }

        Ok(())
    }

    /// Effective cache settings: `video.caching` wins over the top-level
    /// `cache` section, which wins over the baked defaults.
    pub fn cache_settings(&self) -> CacheSettings {
        if let Some(settings) = &self.video.caching {
            return settings.clone();
        }
        if let Some(settings) = &self.cache {
            return settings.clone();
        }
        CacheSettings::default()
    }

    /// The validated origin table. Present after `finalize` succeeded.
    pub fn origins(&self) -> &[OriginConfig] {
        self.video.origins.as_deref().unwrap_or(&[])
    }

    /// Merge a partial document section-wise and re-validate. On failure the
    /// caller keeps the previous configuration.
    pub fn update(&self, partial: serde_json::Value) -> Result<Config, ServiceError> {
        let mut merged = serde_json::to_value(self)
            .map_err(|e| ServiceError::Configuration(e.to_string()))?;
        let partial_map = partial.as_object().ok_or_else(|| {
            ServiceError::Configuration("partial update must be a JSON object".to_string())
        })?;

        for section in ["video", "cache", "logging", "debug"] {
            if let Some(value) = partial_map.get(section) {
                merged[section] = value.clone();
            }
        }
        if let Some(unknown) = partial_map.keys().find(|k| {
            !matches!(k.as_str(), "video" | "cache" | "logging" | "debug")
        }) {
            return Err(ServiceError::Configuration(format!(
                "unknown configuration section '{}'",
                unknown
            )));
        }

        let updated: Config = serde_json::from_value(merged)
            .map_err(|e| ServiceError::Configuration(e.to_string()))?;
        updated.finalize()
    }
}

fn validate_source(origin_name: &str, source: &SourceConfig) -> Result<(), ServiceError> {
    match source {
        SourceConfig::R2 { bucket_binding, .. } => {
            if bucket_binding.is_empty() {
                return Err(ServiceError::Configuration(format!(
                    "origin '{}': r2 source requires a bucketBinding",
                    origin_name
                )));
            }
        }
        SourceConfig::Remote { url, auth, .. } | SourceConfig::Fallback { url, auth, .. } => {
            if url.is_empty() {
                return Err(ServiceError::Configuration(format!(
                    "origin '{}': http source requires a url",
                    origin_name
                )));
            }
            if let Some(auth) = auth {
                validate_auth(origin_name, auth)?;
            }
        }
    }
    Ok(())
}

fn validate_auth(origin_name: &str, auth: &AuthConfig) -> Result<(), ServiceError> {
    let empty = |field: &str| {
        Err(ServiceError::Configuration(format!(
            "origin '{}': auth field '{}' cannot be empty",
            origin_name, field
        )))
    };
    match auth {
        AuthConfig::AwsS3 {
            access_key_var,
            secret_key_var,
            ..
        }
        | AuthConfig::AwsS3PresignedUrl {
            access_key_var,
            secret_key_var,
            ..
        } => {
            if access_key_var.is_empty() {
                return empty("accessKeyVar");
            }
            if secret_key_var.is_empty() {
                return empty("secretKeyVar");
            }
        }
        AuthConfig::Bearer { token_var, .. } => {
            if token_var.is_empty() {
                return empty("tokenVar");
            }
        }
        AuthConfig::Basic { username_var, password_var, .. } => {
            if username_var.is_empty() {
                return empty("usernameVar");
            }
            if password_var.is_empty() {
                return empty("passwordVar");
            }
        }
        AuthConfig::Token { token_var, header_name, .. } => {
            if token_var.is_empty() {
                return empty("tokenVar");
            }
            if header_name.is_empty() {
                return empty("headerName");
            }
        }
        AuthConfig::Header { .. } | AuthConfig::Query { .. } => {}
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DebugConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_ORIGINS: &str = r#"
video:
  origins:
    - name: videos
      matcher: "^/videos/(.*)$"
      sources:
        - type: r2
          priority: 0
          path: "${1}"
          bucketBinding: VIDEOS_BUCKET
"#;

    #[test]
    fn test_can_load_minimal_origin_config() {
        let config = Config::from_yaml_str(MINIMAL_ORIGINS).expect("config should load");
        assert_eq!(config.origins().len(), 1);
        assert_eq!(config.origins()[0].name, "videos");
    }

    #[test]
    fn test_load_fails_without_origins_or_patterns() {
        let result = Config::from_yaml_str("video: {}\n");
        assert!(matches!(result, Err(ServiceError::Configuration(_))));
    }

    #[test]
    fn test_legacy_patterns_are_synthesized_at_load() {
        let yaml = r#"
video:
  pathPatterns:
    - name: videos
      matcher: "^/videos/(.*)$"
  storage:
    r2:
      bucketBinding: VIDEOS_BUCKET
    remoteUrl: https://origin.example.com
"#;
        let config = Config::from_yaml_str(yaml).expect("legacy config should load");
        let origins = config.origins();
        assert_eq!(origins.len(), 1);
        assert_eq!(origins[0].sources.len(), 2);
        assert_eq!(origins[0].sources[0].source_type(), SourceType::R2);
    }

    #[test]
    fn test_duplicate_origin_names_rejected() {
        let yaml = r#"
video:
  origins:
    - name: videos
      matcher: "^/videos/(.*)$"
      sources:
        - {type: r2, path: "${1}", bucketBinding: A}
    - name: videos
      matcher: "^/v2/(.*)$"
      sources:
        - {type: r2, path: "${1}", bucketBinding: B}
"#;
        let result = Config::from_yaml_str(yaml);
        assert!(result.is_err(), "duplicate origin names must be rejected");
    }

    #[test]
    fn test_invalid_matcher_regex_rejected() {
        let yaml = r#"
video:
  origins:
    - name: broken
      matcher: "^/videos/(unclosed"
      sources:
        - {type: r2, path: "${0}", bucketBinding: A}
"#;
        let result = Config::from_yaml_str(yaml);
        assert!(result.is_err(), "invalid matcher regex must be rejected");
    }

    #[test]
    fn test_video_caching_beats_top_level_cache() {
        let yaml = r#"
video:
  origins:
    - name: videos
      matcher: "^/videos/(.*)$"
      sources:
        - {type: r2, path: "${1}", bucketBinding: A}
  caching:
    defaultTtl:
      ok: 1111
cache:
  defaultTtl:
    ok: 2222
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache_settings().default_ttl.ok, 1111);
    }

    #[test]
    fn test_top_level_cache_applies_when_video_caching_absent() {
        let yaml = r#"
video:
  origins:
    - name: videos
      matcher: "^/videos/(.*)$"
      sources:
        - {type: r2, path: "${1}", bucketBinding: A}
cache:
  defaultTtl:
    ok: 2222
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache_settings().default_ttl.ok, 2222);
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let yaml = r#"
video:
  origins:
    - name: videos
      matcher: "^/videos/(.*)$"
      sources:
        - {type: r2, path: "${1}", bucketBinding: A}
mystery: true
"#;
        assert!(Config::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_update_merges_section_and_revalidates() {
        let config = Config::from_yaml_str(MINIMAL_ORIGINS).unwrap();
        let updated = config
            .update(serde_json::json!({
                "cache": {"defaultTtl": {"ok": 500}}
            }))
            .expect("valid partial update should apply");
        assert_eq!(updated.cache_settings().default_ttl.ok, 500);
        // Untouched sections survive the merge.
        assert_eq!(updated.origins().len(), 1);
    }

    #[test]
    fn test_update_rejects_invalid_partial() {
        let config = Config::from_yaml_str(MINIMAL_ORIGINS).unwrap();
        let result = config.update(serde_json::json!({
            "video": {"origins": []}
        }));
        assert!(result.is_err(), "update must re-validate the full schema");
    }

    #[test]
    fn test_update_rejects_unknown_section() {
        let config = Config::from_yaml_str(MINIMAL_ORIGINS).unwrap();
        let result = config.update(serde_json::json!({"metrics": {}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = Config::from_yaml_str(MINIMAL_ORIGINS).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back = Config::from_json_str(&json).expect("round-trip should load");
        assert_eq!(back.origins()[0].name, "videos");
        assert_eq!(back.video.base_path, config.video.base_path);
    }

    #[tokio::test]
    async fn test_from_kv_reads_worker_config_document() {
        use crate::storage::memory::MemoryKvStore;
        use crate::storage::KvStore;

        let kv = MemoryKvStore::new();
        let config = Config::from_yaml_str(MINIMAL_ORIGINS).unwrap();
        kv.put(
            crate::constants::CONFIG_KV_KEY,
            bytes::Bytes::from(serde_json::to_string(&config).unwrap()),
            None,
            None,
        )
        .await
        .unwrap();

        let loaded = Config::from_kv(&kv).await.expect("kv config should load");
        assert_eq!(loaded.origins()[0].name, "videos");

        let empty = MemoryKvStore::new();
        assert!(Config::from_kv(&empty).await.is_err());
    }

    #[test]
    fn test_from_file_dispatches_on_extension() {
        use std::io::Write;
        let mut yaml_file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        yaml_file.write_all(MINIMAL_ORIGINS.as_bytes()).unwrap();
        yaml_file.flush().unwrap();
        assert!(Config::from_file(yaml_file.path()).is_ok());

        let config = Config::from_yaml_str(MINIMAL_ORIGINS).unwrap();
        let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        json_file
            .write_all(serde_json::to_string(&config).unwrap().as_bytes())
            .unwrap();
        json_file.flush().unwrap();
        assert!(Config::from_file(json_file.path()).is_ok());
    }
}
