//! Origin and source configuration types
//!
//! An `Origin` is a named routing rule mapping a path pattern to an ordered
//! list of backend `Source`s. Sources and auth records are tagged unions:
//! the wire `type` field selects the variant, and per-variant required fields
//! are enforced by the shape of the enum rather than by nullable fields.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transform::{Fit, Mode};

/// A named routing rule. The first origin whose `matcher` hits the request
/// path wins; its sources are then trialled in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OriginConfig {
    pub name: String,
    /// Regex matched against the request path. Anchoring is the author's
    /// responsibility.
    pub matcher: String,
    /// Ordered list of capture names usable as `${name}` in source paths.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capture_groups: Vec<String>,
    pub sources: Vec<SourceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<TtlConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacheability: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_options: Option<TransformOverrides>,
}

/// Backend location kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    R2,
    Remote,
    Fallback,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::R2 => write!(f, "r2"),
            SourceType::Remote => write!(f, "remote"),
            SourceType::Fallback => write!(f, "fallback"),
        }
    }
}

/// A concrete backend. `r2` reads a host-native bucket binding; `remote` and
/// `fallback` are HTTP origins, differing only in trial semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    #[serde(rename_all = "camelCase")]
    R2 {
        #[serde(default)]
        priority: i32,
        /// Template with `${0}` (full match), `${n}`, and `${name}` substitutions.
        path: String,
        bucket_binding: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControlConfig>,
    },
    #[serde(rename_all = "camelCase")]
    Remote {
        #[serde(default)]
        priority: i32,
        path: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<AuthConfig>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControlConfig>,
    },
    #[serde(rename_all = "camelCase")]
    Fallback {
        #[serde(default)]
        priority: i32,
        path: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<AuthConfig>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControlConfig>,
    },
}

impl SourceConfig {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceConfig::R2 { .. } => SourceType::R2,
            SourceConfig::Remote { .. } => SourceType::Remote,
            SourceConfig::Fallback { .. } => SourceType::Fallback,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            SourceConfig::R2 { priority, .. }
            | SourceConfig::Remote { priority, .. }
            | SourceConfig::Fallback { priority, .. } => *priority,
        }
    }

    pub fn path_template(&self) -> &str {
        match self {
            SourceConfig::R2 { path, .. }
            | SourceConfig::Remote { path, .. }
            | SourceConfig::Fallback { path, .. } => path,
        }
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        match self {
            SourceConfig::R2 { headers, .. }
            | SourceConfig::Remote { headers, .. }
            | SourceConfig::Fallback { headers, .. } => headers,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            SourceConfig::R2 { .. } => None,
            SourceConfig::Remote { url, .. } | SourceConfig::Fallback { url, .. } => {
                Some(url.as_str())
            }
        }
    }

    pub fn auth(&self) -> Option<&AuthConfig> {
        match self {
            SourceConfig::R2 { .. } => None,
            SourceConfig::Remote { auth, .. } | SourceConfig::Fallback { auth, .. } => {
                auth.as_ref()
            }
        }
    }
}

/// Per-source authentication. The `type` tag selects the scheme; credentials
/// are referenced by environment variable NAME and resolved per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthConfig {
    #[serde(rename_all = "camelCase")]
    AwsS3 {
        #[serde(default = "default_enabled")]
        enabled: bool,
        access_key_var: String,
        secret_key_var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token_var: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AwsS3PresignedUrl {
        #[serde(default = "default_enabled")]
        enabled: bool,
        access_key_var: String,
        secret_key_var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token_var: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_in_seconds: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Bearer {
        #[serde(default = "default_enabled")]
        enabled: bool,
        token_var: String,
    },
    #[serde(rename_all = "camelCase")]
    Basic {
        #[serde(default = "default_enabled")]
        enabled: bool,
        username_var: String,
        password_var: String,
    },
    #[serde(rename_all = "camelCase")]
    Header {
        #[serde(default = "default_enabled")]
        enabled: bool,
        /// Header name to value template; values may reference `${VAR}`.
        headers: HashMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    Query {
        #[serde(default = "default_enabled")]
        enabled: bool,
        params: HashMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    Token {
        #[serde(default = "default_enabled")]
        enabled: bool,
        token_var: String,
        header_name: String,
    },
}

fn default_enabled() -> bool {
    true
}

impl AuthConfig {
    pub fn enabled(&self) -> bool {
        match self {
            AuthConfig::AwsS3 { enabled, .. }
            | AuthConfig::AwsS3PresignedUrl { enabled, .. }
            | AuthConfig::Bearer { enabled, .. }
            | AuthConfig::Basic { enabled, .. }
            | AuthConfig::Header { enabled, .. }
            | AuthConfig::Query { enabled, .. }
            | AuthConfig::Token { enabled, .. } => *enabled,
        }
    }

    /// Wire identifier of the scheme, used in presign cache keys.
    pub fn kind_label(&self) -> &'static str {
        match self {
            AuthConfig::AwsS3 { .. } => "aws-s3",
            AuthConfig::AwsS3PresignedUrl { .. } => "aws-s3-presigned-url",
            AuthConfig::Bearer { .. } => "bearer",
            AuthConfig::Basic { .. } => "basic",
            AuthConfig::Header { .. } => "header",
            AuthConfig::Query { .. } => "query",
            AuthConfig::Token { .. } => "token",
        }
    }
}

/// Per-status TTL table in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TtlConfig {
    #[serde(default = "default_ttl_ok")]
    pub ok: u64,
    #[serde(default = "default_ttl_redirects")]
    pub redirects: u64,
    #[serde(default = "default_ttl_client_error")]
    pub client_error: u64,
    #[serde(default = "default_ttl_server_error")]
    pub server_error: u64,
}

fn default_ttl_ok() -> u64 {
    crate::constants::DEFAULT_TTL_OK_SECS
}

fn default_ttl_redirects() -> u64 {
    crate::constants::DEFAULT_TTL_REDIRECT_SECS
}

fn default_ttl_client_error() -> u64 {
    crate::constants::DEFAULT_TTL_CLIENT_ERROR_SECS
}

fn default_ttl_server_error() -> u64 {
    crate::constants::DEFAULT_TTL_SERVER_ERROR_SECS
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            ok: default_ttl_ok(),
            redirects: default_ttl_redirects(),
            client_error: default_ttl_client_error(),
            server_error: default_ttl_server_error(),
        }
    }
}

impl TtlConfig {
    /// TTL to apply for a given response status.
    pub fn for_status(&self, status: u16) -> u64 {
        match status {
            200..=299 => self.ok,
            300..=399 => self.redirects,
            400..=499 => self.client_error,
            _ => self.server_error,
        }
    }
}

/// Advisory cache-control hints attached to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheControlConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_while_revalidate: Option<u64>,
}

/// Optional transform parameter overrides carried by origins and path
/// patterns. Every field is optional; `None` means "no opinion".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransformOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fit: Option<Fit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_playback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoplay: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_parse_r2_source() {
        let yaml = r#"
type: r2
priority: 0
path: "${1}"
bucketBinding: VIDEOS_BUCKET
"#;
        let source: SourceConfig = serde_yaml::from_str(yaml).expect("r2 source should parse");
        assert_eq!(source.source_type(), SourceType::R2);
        assert_eq!(source.priority(), 0);
        assert_eq!(source.path_template(), "${1}");
        assert!(source.url().is_none());
    }

    #[test]
    fn test_can_parse_remote_source_with_auth() {
        let yaml = r#"
type: remote
priority: 1
path: "videos/${1}"
url: "https://origin.example.com"
auth:
  type: aws-s3
  accessKeyVar: ORIGIN_ACCESS_KEY
  secretKeyVar: ORIGIN_SECRET_KEY
  region: us-east-1
"#;
        let source: SourceConfig = serde_yaml::from_str(yaml).expect("remote source should parse");
        assert_eq!(source.source_type(), SourceType::Remote);
        assert_eq!(source.url(), Some("https://origin.example.com"));
        let auth = source.auth().expect("auth should be present");
        assert!(auth.enabled());
        assert_eq!(auth.kind_label(), "aws-s3");
    }

    #[test]
    fn test_remote_source_requires_url() {
        let yaml = r#"
type: remote
priority: 1
path: "videos/${1}"
"#;
        let result: Result<SourceConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err(), "remote source without url must fail to parse");
    }

    #[test]
    fn test_r2_source_requires_bucket_binding() {
        let yaml = r#"
type: r2
path: "${1}"
"#;
        let result: Result<SourceConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err(), "r2 source without bucketBinding must fail to parse");
    }

    #[test]
    fn test_presigned_auth_parses_expiry() {
        let yaml = r#"
type: aws-s3-presigned-url
accessKeyVar: AK
secretKeyVar: SK
expiresInSeconds: 900
"#;
        let auth: AuthConfig = serde_yaml::from_str(yaml).expect("presigned auth should parse");
        match auth {
            AuthConfig::AwsS3PresignedUrl { expires_in_seconds, .. } => {
                assert_eq!(expires_in_seconds, Some(900));
            }
            other => panic!("Expected presigned variant, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_enabled_defaults_to_true() {
        let yaml = r#"
type: bearer
tokenVar: API_TOKEN
"#;
        let auth: AuthConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(auth.enabled());
    }

    #[test]
    fn test_ttl_defaults_and_status_lookup() {
        let ttl = TtlConfig::default();
        assert_eq!(ttl.for_status(200), crate::constants::DEFAULT_TTL_OK_SECS);
        assert_eq!(ttl.for_status(301), crate::constants::DEFAULT_TTL_REDIRECT_SECS);
        assert_eq!(ttl.for_status(404), crate::constants::DEFAULT_TTL_CLIENT_ERROR_SECS);
        assert_eq!(ttl.for_status(503), crate::constants::DEFAULT_TTL_SERVER_ERROR_SECS);
    }

    #[test]
    fn test_origin_rejects_unknown_keys() {
        let yaml = r#"
name: videos
matcher: "^/videos/(.*)$"
bogusKey: true
sources:
  - type: r2
    path: "${1}"
    bucketBinding: VIDEOS_BUCKET
"#;
        let result: Result<OriginConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err(), "unknown keys in an origin must be rejected");
    }

    #[test]
    fn test_transform_overrides_loop_field_round_trips() {
        let yaml = "loop: true\nwidth: 640\n";
        let overrides: TransformOverrides = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(overrides.loop_playback, Some(true));
        assert_eq!(overrides.width, Some(640));

        let json = serde_json::to_value(&overrides).unwrap();
        assert_eq!(json["loop"], serde_json::json!(true));
    }

    #[test]
    fn test_origin_config_round_trips_through_json() {
        let yaml = r#"
name: videos
matcher: "^/videos/(.*)$"
captureGroups: [videoId]
sources:
  - type: r2
    priority: 0
    path: "${1}"
    bucketBinding: VIDEOS_BUCKET
  - type: fallback
    priority: 1
    path: "${0}"
    url: "https://cdn.example.com"
ttl:
  ok: 3600
"#;
        let origin: OriginConfig = serde_yaml::from_str(yaml).unwrap();
        let json = serde_json::to_string(&origin).unwrap();
        let back: OriginConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "videos");
        assert_eq!(back.sources.len(), 2);
        assert_eq!(back.ttl.unwrap().ok, 3600);
        assert_eq!(back.capture_groups, vec!["videoId".to_string()]);
    }
}
