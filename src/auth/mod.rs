//! Request authentication
//!
//! Applies a source's auth record to an outbound request: header-mode
//! signing, presigned URLs, bearer/basic/token headers, or static
//! header/query material with env interpolation. Credentials are resolved
//! from the environment by NAME; a missing variable fails the request with
//! `AuthMisconfigured` naming the variable, never the value.

pub mod sigv4;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;

use crate::config::AuthConfig;
use crate::constants::DEFAULT_PRESIGN_EXPIRES_SECS;
use crate::error::ServiceError;
use crate::storage::{HttpRequest, SecretEnv};

pub use sigv4::AwsCredentials;

/// Look up a required env var, failing with the variable name on absence.
pub fn require_var(env: &dyn SecretEnv, name: &str) -> Result<String, ServiceError> {
    env.var(name)
        .ok_or_else(|| ServiceError::AuthMisconfigured { var: name.to_string() })
}

/// Resolve AWS credentials from the variable names in an auth record.
pub fn resolve_aws_credentials(
    env: &dyn SecretEnv,
    access_key_var: &str,
    secret_key_var: &str,
    session_token_var: Option<&str>,
) -> Result<AwsCredentials, ServiceError> {
    Ok(AwsCredentials {
        access_key: require_var(env, access_key_var)?,
        secret_key: require_var(env, secret_key_var)?,
        session_token: match session_token_var {
            Some(var) => env.var(var),
            None => None,
        },
    })
}

/// Interpolate `${VAR}` references in a header/query template value.
fn interpolate(template: &str, env: &dyn SecretEnv) -> Result<String, ServiceError> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return Ok(result);
        };
        let var = &after[..end];
        result.push_str(&require_var(env, var)?);
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}

/// Apply an auth record to an outbound request. Query-style schemes rewrite
/// the URL; header-style schemes add headers. Disabled records are a no-op.
pub fn apply_auth(
    mut request: HttpRequest,
    auth: &AuthConfig,
    env: &dyn SecretEnv,
) -> Result<HttpRequest, ServiceError> {
    if !auth.enabled() {
        return Ok(request);
    }

    match auth {
        AuthConfig::AwsS3 {
            access_key_var,
            secret_key_var,
            session_token_var,
            region,
            service,
            ..
        } => {
            let credentials = resolve_aws_credentials(
                env,
                access_key_var,
                secret_key_var,
                session_token_var.as_deref(),
            )?;
            let signed = sigv4::sign_request_headers(
                &request.method,
                &request.url,
                region.as_deref().unwrap_or("us-east-1"),
                service.as_deref().unwrap_or("s3"),
                &credentials,
                Utc::now(),
            );
            for (name, value) in signed {
                request.headers.insert(name, value);
            }
            Ok(request)
        }
        AuthConfig::AwsS3PresignedUrl {
            access_key_var,
            secret_key_var,
            session_token_var,
            region,
            service,
            expires_in_seconds,
            ..
        } => {
            let credentials = resolve_aws_credentials(
                env,
                access_key_var,
                secret_key_var,
                session_token_var.as_deref(),
            )?;
            request.url = sigv4::presign_url(
                &request.url,
                region.as_deref().unwrap_or("us-east-1"),
                service.as_deref().unwrap_or("s3"),
                &credentials,
                expires_in_seconds.unwrap_or(DEFAULT_PRESIGN_EXPIRES_SECS),
                Utc::now(),
            );
            Ok(request)
        }
        AuthConfig::Bearer { token_var, .. } => {
            let token = require_var(env, token_var)?;
            request
                .headers
                .insert("authorization".to_string(), format!("Bearer {}", token));
            Ok(request)
        }
        AuthConfig::Basic {
            username_var,
            password_var,
            ..
        } => {
            let username = require_var(env, username_var)?;
            let password = require_var(env, password_var)?;
            let encoded = BASE64.encode(format!("{}:{}", username, password));
            request
                .headers
                .insert("authorization".to_string(), format!("Basic {}", encoded));
            Ok(request)
        }
        AuthConfig::Header { headers, .. } => {
            for (name, template) in headers {
                let value = interpolate(template, env)?;
                request.headers.insert(name.to_ascii_lowercase(), value);
            }
            Ok(request)
        }
        AuthConfig::Query { params, .. } => {
            let mut rendered = Vec::with_capacity(params.len());
            for (name, template) in params {
                let value = interpolate(template, env)?;
                rendered.push(format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(&value)
                ));
            }
            if !rendered.is_empty() {
                let separator = if request.url.contains('?') { '&' } else { '?' };
                request.url = format!("{}{}{}", request.url, separator, rendered.join("&"));
            }
            Ok(request)
        }
        AuthConfig::Token {
            token_var,
            header_name,
            ..
        } => {
            let token = require_var(env, token_var)?;
            request
                .headers
                .insert(header_name.to_ascii_lowercase(), token);
            Ok(request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StaticEnv;

    #[test]
    fn test_bearer_adds_authorization_header() {
        let env = StaticEnv::new(&[("API_TOKEN", "sekrit")]);
        let auth: AuthConfig =
            serde_yaml::from_str("type: bearer\ntokenVar: API_TOKEN\n").unwrap();
        let request = apply_auth(HttpRequest::get("https://o.example.com/a"), &auth, &env).unwrap();
        assert_eq!(
            request.headers.get("authorization").map(String::as_str),
            Some("Bearer sekrit")
        );
    }

    #[test]
    fn test_basic_encodes_credentials() {
        let env = StaticEnv::new(&[("USER", "alice"), ("PASS", "wonder")]);
        let auth: AuthConfig =
            serde_yaml::from_str("type: basic\nusernameVar: USER\npasswordVar: PASS\n").unwrap();
        let request = apply_auth(HttpRequest::get("https://o.example.com/a"), &auth, &env).unwrap();
        // base64("alice:wonder")
        assert_eq!(
            request.headers.get("authorization").map(String::as_str),
            Some("Basic YWxpY2U6d29uZGVy")
        );
    }

    #[test]
    fn test_missing_var_fails_with_name() {
        let env = StaticEnv::default();
        let auth: AuthConfig =
            serde_yaml::from_str("type: bearer\ntokenVar: MISSING_TOKEN\n").unwrap();
        let result = apply_auth(HttpRequest::get("https://o.example.com/a"), &auth, &env);
        match result {
            Err(ServiceError::AuthMisconfigured { var }) => assert_eq!(var, "MISSING_TOKEN"),
            other => panic!("expected AuthMisconfigured, got {:?}", other),
        }
    }

    #[test]
    fn test_disabled_auth_is_noop() {
        let env = StaticEnv::default();
        let auth: AuthConfig =
            serde_yaml::from_str("type: bearer\nenabled: false\ntokenVar: MISSING\n").unwrap();
        let request = apply_auth(HttpRequest::get("https://o.example.com/a"), &auth, &env).unwrap();
        assert!(request.headers.is_empty());
    }

    #[test]
    fn test_header_auth_interpolates_env_references() {
        let env = StaticEnv::new(&[("EDGE_KEY", "k123")]);
        let auth: AuthConfig = serde_yaml::from_str(
            "type: header\nheaders:\n  X-Edge-Key: \"key=${EDGE_KEY}\"\n",
        )
        .unwrap();
        let request = apply_auth(HttpRequest::get("https://o.example.com/a"), &auth, &env).unwrap();
        assert_eq!(
            request.headers.get("x-edge-key").map(String::as_str),
            Some("key=k123")
        );
    }

    #[test]
    fn test_query_auth_appends_params() {
        let env = StaticEnv::new(&[("SIG", "abc def")]);
        let auth: AuthConfig =
            serde_yaml::from_str("type: query\nparams:\n  sig: \"${SIG}\"\n").unwrap();
        let request =
            apply_auth(HttpRequest::get("https://o.example.com/a?x=1"), &auth, &env).unwrap();
        assert_eq!(request.url, "https://o.example.com/a?x=1&sig=abc%20def");
    }

    #[test]
    fn test_token_auth_uses_configured_header_name() {
        let env = StaticEnv::new(&[("CDN_TOKEN", "tok")]);
        let auth: AuthConfig = serde_yaml::from_str(
            "type: token\ntokenVar: CDN_TOKEN\nheaderName: X-Cdn-Token\n",
        )
        .unwrap();
        let request = apply_auth(HttpRequest::get("https://o.example.com/a"), &auth, &env).unwrap();
        assert_eq!(request.headers.get("x-cdn-token").map(String::as_str), Some("tok"));
    }

    #[test]
    fn test_aws_s3_signs_headers() {
        let env = StaticEnv::new(&[("AK", "AKIAEXAMPLE"), ("SK", "secret")]);
        let auth: AuthConfig = serde_yaml::from_str(
            "type: aws-s3\naccessKeyVar: AK\nsecretKeyVar: SK\nregion: eu-west-1\n",
        )
        .unwrap();
        let request = apply_auth(
            HttpRequest::get("https://bucket.s3.eu-west-1.amazonaws.com/videos/a.mp4"),
            &auth,
            &env,
        )
        .unwrap();
        assert!(request.headers.contains_key("authorization"));
        assert!(request.headers.contains_key("x-amz-date"));
        assert!(request.headers.contains_key("x-amz-content-sha256"));
    }

    #[test]
    fn test_presigned_auth_rewrites_url() {
        let env = StaticEnv::new(&[("AK", "AKIAEXAMPLE"), ("SK", "secret")]);
        let auth: AuthConfig = serde_yaml::from_str(
            "type: aws-s3-presigned-url\naccessKeyVar: AK\nsecretKeyVar: SK\nexpiresInSeconds: 600\n",
        )
        .unwrap();
        let request = apply_auth(
            HttpRequest::get("https://bucket.s3.us-east-1.amazonaws.com/videos/a.mp4"),
            &auth,
            &env,
        )
        .unwrap();
        assert!(request.url.contains("X-Amz-Signature="));
        assert!(request.url.contains("X-Amz-Expires=600"));
        assert!(request.headers.is_empty(), "presigned auth adds no headers");
    }

    #[test]
    fn test_interpolation_passes_through_plain_text() {
        let env = StaticEnv::default();
        assert_eq!(interpolate("no refs here", &env).unwrap(), "no refs here");
    }
}
