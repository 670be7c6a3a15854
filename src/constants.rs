// Constants module - centralized default values for configuration
//
// This module defines all default values used throughout the codebase.
// Using constants instead of magic numbers improves maintainability
// and makes it easier to understand and modify defaults.

// =============================================================================
// Fetch defaults
// =============================================================================

/// Default per-attempt timeout for outbound fetches in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default overall budget for a source-failover pass in seconds
pub const DEFAULT_FAILOVER_BUDGET_SECS: u64 = 90;

// =============================================================================
// Result cache defaults
// =============================================================================

/// Bodies at or below this size are stored as a single KV entry (20 MiB)
pub const DEFAULT_SINGLE_ENTRY_MAX_BYTES: u64 = 20 * 1024 * 1024;

/// Chunk size for chunked cache entries (10 MiB)
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Fallback bodies larger than this are never cached in the background (128 MiB)
pub const DEFAULT_FALLBACK_CACHE_MAX_BYTES: u64 = 128 * 1024 * 1024;

/// Default TTL for successful responses in seconds
pub const DEFAULT_TTL_OK_SECS: u64 = 86400;

/// Default TTL for redirect responses in seconds
pub const DEFAULT_TTL_REDIRECT_SECS: u64 = 3600;

/// Default TTL for client-error responses in seconds
pub const DEFAULT_TTL_CLIENT_ERROR_SECS: u64 = 60;

/// Default TTL for server-error responses in seconds
pub const DEFAULT_TTL_SERVER_ERROR_SECS: u64 = 10;

/// Refresh-on-read fires once this share of the TTL has elapsed
pub const DEFAULT_REFRESH_MIN_ELAPSED_PERCENT: f64 = 80.0;

/// Refresh-on-read fires only when less than this many seconds remain
pub const DEFAULT_REFRESH_MIN_REMAINING_SECS: u64 = 60;

// =============================================================================
// Presigned URL defaults
// =============================================================================

/// Default lifetime of a minted presigned URL in seconds
pub const DEFAULT_PRESIGN_EXPIRES_SECS: u64 = 3600;

/// A presigned URL within this many seconds of expiry is refreshed
pub const DEFAULT_PRESIGN_REFRESH_THRESHOLD_SECS: u64 = 300;

// =============================================================================
// Transform defaults
// =============================================================================

/// Default CDN media transformation base path
pub const DEFAULT_TRANSFORM_BASE_PATH: &str = "/cdn-cgi/media";

// =============================================================================
// Key prefixes
// =============================================================================

/// Prefix for result cache keys
pub const RESULT_KEY_PREFIX: &str = "video";

/// Prefix for presigned URL cache keys
pub const PRESIGN_KEY_PREFIX: &str = "presigned";

/// KV key holding the worker configuration document
pub const CONFIG_KV_KEY: &str = "worker-config";
