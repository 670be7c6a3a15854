//! Cache section of the worker configuration
//!
//! TTL profiles are selected by the first regex that matches the source
//! path; the default profile applies otherwise. Size thresholds drive the
//! single-entry vs. chunked layout decision in the result cache.

use serde::{Deserialize, Serialize};

use super::origin::TtlConfig;
use crate::constants::{
    DEFAULT_CHUNK_SIZE_BYTES, DEFAULT_FAILOVER_BUDGET_SECS, DEFAULT_FALLBACK_CACHE_MAX_BYTES,
    DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_REFRESH_MIN_ELAPSED_PERCENT,
    DEFAULT_REFRESH_MIN_REMAINING_SECS, DEFAULT_SINGLE_ENTRY_MAX_BYTES,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheSettings {
    /// Storage method; only `kv` is supported.
    #[serde(default = "default_method")]
    pub method: String,
    /// TTL profiles tried in order; first regex match wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<CacheProfile>,
    #[serde(default)]
    pub default_ttl: TtlConfig,
    /// Query parameters whose presence disables the result cache.
    #[serde(default = "default_bypass_params")]
    pub bypass_params: Vec<String>,
    /// Suppress the KV expiration TTL entirely.
    #[serde(default)]
    pub store_indefinitely: bool,
    #[serde(default)]
    pub refresh: RefreshSettings,
    #[serde(default = "default_single_entry_max")]
    pub single_entry_max_bytes: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
    /// Fallback bodies above this size are never cached in the background.
    #[serde(default = "default_fallback_cache_max")]
    pub fallback_cache_max_bytes: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
    #[serde(default = "default_failover_budget")]
    pub failover_budget_seconds: u64,
    /// Hard upper bound on cacheable body size, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            method: default_method(),
            profiles: Vec::new(),
            default_ttl: TtlConfig::default(),
            bypass_params: default_bypass_params(),
            store_indefinitely: false,
            refresh: RefreshSettings::default(),
            single_entry_max_bytes: default_single_entry_max(),
            chunk_size_bytes: default_chunk_size(),
            fallback_cache_max_bytes: default_fallback_cache_max(),
            fetch_timeout_seconds: default_fetch_timeout(),
            failover_budget_seconds: default_failover_budget(),
            max_size_bytes: None,
        }
    }
}

impl CacheSettings {
    /// TTL table for a source path: first matching profile, else default.
    pub fn ttl_for_path(&self, path: &str) -> TtlConfig {
        for profile in &self.profiles {
            if let Ok(re) = regex::Regex::new(&profile.pattern) {
                if re.is_match(path) {
                    return profile.ttl;
                }
            }
        }
        self.default_ttl
    }

    /// Whether a profile marks this path uncacheable.
    pub fn cacheable_path(&self, path: &str) -> bool {
        for profile in &self.profiles {
            if let Ok(re) = regex::Regex::new(&profile.pattern) {
                if re.is_match(path) {
                    return profile.cacheability;
                }
            }
        }
        true
    }

    pub fn is_bypass_param(&self, name: &str) -> bool {
        self.bypass_params.iter().any(|p| p == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheProfile {
    /// Regex matched against the source path.
    pub pattern: String,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default = "default_true")]
    pub cacheability: bool,
}

/// Refresh-on-read thresholds: both conditions must hold before a
/// background revalidation is scheduled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RefreshSettings {
    #[serde(default = "default_min_elapsed_percent")]
    pub min_elapsed_percent: f64,
    #[serde(default = "default_min_remaining_seconds")]
    pub min_remaining_seconds: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            min_elapsed_percent: default_min_elapsed_percent(),
            min_remaining_seconds: default_min_remaining_seconds(),
        }
    }
}

fn default_method() -> String {
    "kv".to_string()
}

fn default_bypass_params() -> Vec<String> {
    vec!["nocache".to_string(), "bypass".to_string()]
}

fn default_single_entry_max() -> u64 {
    DEFAULT_SINGLE_ENTRY_MAX_BYTES
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE_BYTES
}

fn default_fallback_cache_max() -> u64 {
    DEFAULT_FALLBACK_CACHE_MAX_BYTES
}

fn default_fetch_timeout() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_failover_budget() -> u64 {
    DEFAULT_FAILOVER_BUDGET_SECS
}

fn default_min_elapsed_percent() -> f64 {
    DEFAULT_REFRESH_MIN_ELAPSED_PERCENT
}

fn default_min_remaining_seconds() -> u64 {
    DEFAULT_REFRESH_MIN_REMAINING_SECS
}

fn default_true() -> bool {
    true
}
