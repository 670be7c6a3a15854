// Error types module

use std::fmt;

/// Centralized error taxonomy for the transformation proxy
///
/// Categorizes errors for debugging, monitoring, and HTTP status code
/// mapping. The variants mirror the externally observable failure modes:
/// configuration problems surface at load time, everything else mid-request.
#[derive(Debug, Clone)]
pub enum ServiceError {
    /// Invalid or missing configuration schema field; never surfaces mid-request
    Configuration(String),

    /// Client input does not satisfy an enum or range; not retried
    Validation(String),

    /// Path matches no origin, or every source returned 404
    NotFound(String),

    /// Transport failure or 5xx from all sources
    OriginUnavailable(String),

    /// Transform endpoint returned 5xx or an unclassified 4xx
    TransformationFailed(String),

    /// A referenced credential env var is absent or empty
    AuthMisconfigured {
        /// Name of the missing variable. Never carries the value.
        var: String,
    },

    /// KV read/write failure; never fatal to the request
    Cache(String),

    /// Catch-all
    Unknown(String),
}

impl ServiceError {
    /// HTTP status code for this error per the taxonomy
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Configuration(_) => 500,
            ServiceError::Validation(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::OriginUnavailable(_) => 502,
            ServiceError::TransformationFailed(_) => 502,
            ServiceError::AuthMisconfigured { .. } => 500,
            ServiceError::Cache(_) => 500,
            ServiceError::Unknown(_) => 500,
        }
    }

    /// Stable identifier used in the `X-Error-Type` response header
    pub fn error_type(&self) -> &'static str {
        match self {
            ServiceError::Configuration(_) => "ConfigurationError",
            ServiceError::Validation(_) => "ValidationError",
            ServiceError::NotFound(_) => "NotFoundError",
            ServiceError::OriginUnavailable(_) => "OriginUnavailable",
            ServiceError::TransformationFailed(_) => "TransformationFailed",
            ServiceError::AuthMisconfigured { .. } => "AuthMisconfigured",
            ServiceError::Cache(_) => "CacheError",
            ServiceError::Unknown(_) => "UnknownError",
        }
    }

    /// Terminal JSON error document `{error, message, statusCode}`
    pub fn to_json_body(&self) -> String {
        serde_json::json!({
            "error": self.error_type(),
            "message": self.to_string(),
            "statusCode": self.status_code(),
        })
        .to_string()
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ServiceError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ServiceError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ServiceError::OriginUnavailable(msg) => write!(f, "Origin unavailable: {}", msg),
            ServiceError::TransformationFailed(msg) => {
                write!(f, "Transformation failed: {}", msg)
            }
            ServiceError::AuthMisconfigured { var } => {
                write!(
                    f,
                    "Auth misconfigured: environment variable '{}' is missing or empty",
                    var
                )
            }
            ServiceError::Cache(msg) => write!(f, "Cache error: {}", msg),
            ServiceError::Unknown(msg) => write!(f, "Unknown error: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(ServiceError::Validation("bad width".into()).status_code(), 400);
        assert_eq!(ServiceError::NotFound("no origin".into()).status_code(), 404);
        assert_eq!(
            ServiceError::OriginUnavailable("all sources down".into()).status_code(),
            502
        );
        assert_eq!(
            ServiceError::AuthMisconfigured { var: "AWS_KEY".into() }.status_code(),
            500
        );
    }

    #[test]
    fn test_error_type_is_stable_identifier() {
        assert_eq!(
            ServiceError::TransformationFailed("500 from transformer".into()).error_type(),
            "TransformationFailed"
        );
        assert_eq!(ServiceError::Cache("kv write".into()).error_type(), "CacheError");
    }

    #[test]
    fn test_auth_misconfigured_names_variable_not_value() {
        let err = ServiceError::AuthMisconfigured { var: "ORIGIN_SECRET_KEY".into() };
        let display = err.to_string();
        assert!(display.contains("ORIGIN_SECRET_KEY"));
        assert!(display.contains("missing or empty"));
    }

    #[test]
    fn test_json_body_has_error_message_and_status() {
        let err = ServiceError::NotFound("no origin matched /x".into());
        let body: serde_json::Value = serde_json::from_str(&err.to_json_body()).unwrap();
        assert_eq!(body["error"], "NotFoundError");
        assert_eq!(body["statusCode"], 404);
        assert!(body["message"].as_str().unwrap().contains("/x"));
    }
}
