//! Origin resolution
//!
//! Maps a request path to the first matching origin (declaration order) and
//! materializes its sources: path templates substituted with the regex
//! captures, ineligible sources dropped, the rest ordered by ascending
//! priority with declaration order breaking ties. Matchers are compiled once
//! when the resolver is built from a configuration snapshot.

use std::collections::HashMap;

use regex::Regex;

use crate::config::{AuthConfig, Config, OriginConfig, SourceConfig, SourceType};
use crate::error::ServiceError;

pub struct OriginResolver {
    entries: Vec<CompiledOrigin>,
}

struct CompiledOrigin {
    config: OriginConfig,
    matcher: Regex,
}

/// A source with its concrete path computed for one request.
#[derive(Debug, Clone)]
pub enum ResolvedSource {
    R2 {
        priority: i32,
        path: String,
        binding: String,
        headers: HashMap<String, String>,
    },
    Remote {
        priority: i32,
        path: String,
        url: String,
        auth: Option<AuthConfig>,
        headers: HashMap<String, String>,
    },
    Fallback {
        priority: i32,
        path: String,
        url: String,
        auth: Option<AuthConfig>,
        headers: HashMap<String, String>,
    },
}

impl ResolvedSource {
    pub fn priority(&self) -> i32 {
        match self {
            ResolvedSource::R2 { priority, .. }
            | ResolvedSource::Remote { priority, .. }
            | ResolvedSource::Fallback { priority, .. } => *priority,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ResolvedSource::R2 { path, .. }
            | ResolvedSource::Remote { path, .. }
            | ResolvedSource::Fallback { path, .. } => path,
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            ResolvedSource::R2 { .. } => SourceType::R2,
            ResolvedSource::Remote { .. } => SourceType::Remote,
            ResolvedSource::Fallback { .. } => SourceType::Fallback,
        }
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        match self {
            ResolvedSource::R2 { headers, .. }
            | ResolvedSource::Remote { headers, .. }
            | ResolvedSource::Fallback { headers, .. } => headers,
        }
    }

    pub fn auth(&self) -> Option<&AuthConfig> {
        match self {
            ResolvedSource::R2 { .. } => None,
            ResolvedSource::Remote { auth, .. } | ResolvedSource::Fallback { auth, .. } => {
                auth.as_ref()
            }
        }
    }

    /// Full HTTP URL for remote/fallback sources; an r2 source has none.
    pub fn effective_url(&self) -> Option<String> {
        match self {
            ResolvedSource::R2 { .. } => None,
            ResolvedSource::Remote { url, path, .. }
            | ResolvedSource::Fallback { url, path, .. } => Some(join_url(url, path)),
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Result of a successful resolution.
#[derive(Debug, Clone)]
pub struct OriginMatch {
    pub origin: OriginConfig,
    pub sources: Vec<ResolvedSource>,
}

impl OriginResolver {
    /// Compile every origin matcher from a validated configuration.
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        let mut entries = Vec::new();
        for origin in config.origins() {
            let matcher = Regex::new(&origin.matcher).map_err(|e| {
                ServiceError::Configuration(format!(
                    "origin '{}' matcher is not a valid regex: {}",
                    origin.name, e
                ))
            })?;
            entries.push(CompiledOrigin {
                config: origin.clone(),
                matcher,
            });
        }
        Ok(Self { entries })
    }

    /// Resolve a request path. `has_bucket` reports whether a bucket binding
    /// is live; r2 sources without one are skipped, not errored.
    pub fn resolve<F>(&self, path: &str, has_bucket: F) -> Result<OriginMatch, ServiceError>
    where
        F: Fn(&str) -> bool,
    {
        for entry in &self.entries {
            let Some(captures) = entry.matcher.captures(path) else {
                continue;
            };

            let mut sources: Vec<ResolvedSource> = Vec::new();
            for source in &entry.config.sources {
                let concrete_path = substitute_template(
                    source.path_template(),
                    &captures,
                    &entry.config.capture_groups,
                );
                match source {
                    SourceConfig::R2 {
                        priority,
                        bucket_binding,
                        headers,
                        ..
                    } => {
                        if !has_bucket(bucket_binding) {
                            tracing::debug!(
                                origin = %entry.config.name,
                                binding = %bucket_binding,
                                "skipping r2 source without live bucket binding"
                            );
                            continue;
                        }
                        sources.push(ResolvedSource::R2 {
                            priority: *priority,
                            path: concrete_path,
                            binding: bucket_binding.clone(),
                            headers: headers.clone(),
                        });
                    }
                    SourceConfig::Remote {
                        priority,
                        url,
                        auth,
                        headers,
                        ..
                    } => {
                        if url.is_empty() {
                            continue;
                        }
                        sources.push(ResolvedSource::Remote {
                            priority: *priority,
                            path: concrete_path,
                            url: url.clone(),
                            auth: auth.clone(),
                            headers: headers.clone(),
                        });
                    }
                    SourceConfig::Fallback {
                        priority,
                        url,
                        auth,
                        headers,
                        ..
                    } => {
                        if url.is_empty() {
                            continue;
                        }
                        sources.push(ResolvedSource::Fallback {
                            priority: *priority,
                            path: concrete_path,
                            url: url.clone(),
                            auth: auth.clone(),
                            headers: headers.clone(),
                        });
                    }
                }
            }

            // Stable sort keeps declaration order within equal priorities.
            sources.sort_by_key(|s| s.priority());

            tracing::debug!(
                origin = %entry.config.name,
                path = %path,
                eligible = sources.len(),
                "origin resolved"
            );
            return Ok(OriginMatch {
                origin: entry.config.clone(),
                sources,
            });
        }

        Err(ServiceError::NotFound(format!("no origin matches path '{}'", path)))
    }
}

/// Substitute `${0}`, `${n}`, and `${name}` references. A group that did not
/// participate or matched empty falls back to the full match.
fn substitute_template(
    template: &str,
    captures: &regex::Captures<'_>,
    capture_groups: &[String],
) -> String {
    let full_match = captures.get(0).map(|m| m.as_str()).unwrap_or("");
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };
        let reference = &after[..end];

        let resolved: Option<&str> = if let Ok(index) = reference.parse::<usize>() {
            captures.get(index).map(|m| m.as_str())
        } else if let Some(named) = captures.name(reference) {
            Some(named.as_str())
        } else {
            capture_groups
                .iter()
                .position(|name| name == reference)
                .and_then(|position| captures.get(position + 1))
                .map(|m| m.as_str())
        };

        match resolved {
            Some(value) if !value.is_empty() => result.push_str(value),
            _ => result.push_str(full_match),
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    result
}
