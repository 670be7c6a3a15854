//! Result cache key derivation
//!
//! Logical form:
//! `video:<normalized-source-path>[:derivative=<name>][:w=<n>][:h=<n>][:f=<fmt>][:q=<quality>][:t=<time>][:d=<duration>]`
//!
//! Segments are included iff the option is set, in stable order. Keys with a
//! derivative never carry `w`/`h`: the derivative's own dimensions are
//! authoritative. Normalization strips leading slashes, maps spaces to
//! hyphens, and replaces anything outside `[A-Za-z0-9/:=.\-]` with a hyphen.

use std::fmt;
use std::str::FromStr;

use crate::constants::RESULT_KEY_PREFIX;
use crate::error::ServiceError;
use crate::transform::TransformOptions;

/// Normalize a source path for use inside a cache key.
pub fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/')
        .chars()
        .map(|c| match c {
            ' ' => '-',
            c if c.is_ascii_alphanumeric() => c,
            '/' | ':' | '=' | '.' | '-' => c,
            _ => '-',
        })
        .collect()
}

fn normalize_value(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            ' ' => '-',
            c if c.is_ascii_alphanumeric() => c,
            '.' | '-' => c,
            _ => '-',
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source_path: String,
    pub derivative: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub quality: Option<String>,
    pub time: Option<String>,
    pub duration: Option<String>,
}

impl CacheKey {
    /// Derive the key for a source path and resolved options.
    pub fn from_options(source_path: &str, options: &TransformOptions) -> Self {
        let derivative = options.derivative.as_deref().map(normalize_value);
        let (width, height) = if derivative.is_some() {
            // The derivative's dimensions are authoritative; w/h stay out of
            // the key so all requests for the preset share one entry.
            (None, None)
        } else {
            (options.width, options.height)
        };
        Self {
            source_path: normalize_path(source_path),
            derivative,
            width,
            height,
            format: options.format.as_deref().map(normalize_value),
            quality: options.quality.as_deref().map(normalize_value),
            time: options.time.as_deref().map(normalize_value),
            duration: options.duration.as_deref().map(normalize_value),
        }
    }

    /// Key of the n-th chunk of a chunked entry.
    pub fn chunk_key(&self, index: u32) -> String {
        format!("{}:chunk={}", self, index)
    }

    /// Listing prefix for every variant of a source path.
    pub fn variant_prefix(source_path: &str) -> String {
        format!("{}:{}", RESULT_KEY_PREFIX, normalize_path(source_path))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", RESULT_KEY_PREFIX, self.source_path)?;
        if let Some(derivative) = &self.derivative {
            write!(f, ":derivative={}", derivative)?;
        }
        if let Some(width) = self.width {
            write!(f, ":w={}", width)?;
        }
        if let Some(height) = self.height {
            write!(f, ":h={}", height)?;
        }
        if let Some(format) = &self.format {
            write!(f, ":f={}", format)?;
        }
        if let Some(quality) = &self.quality {
            write!(f, ":q={}", quality)?;
        }
        if let Some(time) = &self.time {
            write!(f, ":t={}", time)?;
        }
        if let Some(duration) = &self.duration {
            write!(f, ":d={}", duration)?;
        }
        Ok(())
    }
}

impl FromStr for CacheKey {
    type Err = ServiceError;

    /// Parse a serialized key. Option segments are recognized from the right
    /// by their tags; everything before them is the source path (which may
    /// itself contain colons).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(&format!("{}:", RESULT_KEY_PREFIX))
            .ok_or_else(|| {
                ServiceError::Validation(format!("cache key missing '{}:' prefix", RESULT_KEY_PREFIX))
            })?;
        if rest.is_empty() {
            return Err(ServiceError::Validation("cache key has empty path".to_string()));
        }

        let segments: Vec<&str> = rest.split(':').collect();
        let mut key = CacheKey {
            source_path: String::new(),
            derivative: None,
            width: None,
            height: None,
            format: None,
            quality: None,
            time: None,
            duration: None,
        };

        let mut path_end = segments.len();
        for (index, segment) in segments.iter().enumerate().rev() {
            let Some((tag, value)) = segment.split_once('=') else {
                break;
            };
            let recognized = matches!(tag, "derivative" | "w" | "h" | "f" | "q" | "t" | "d");
            if !recognized || index == 0 {
                break;
            }
            match tag {
                "derivative" => key.derivative = Some(value.to_string()),
                "w" => {
                    key.width = Some(value.parse().map_err(|_| {
                        ServiceError::Validation(format!("invalid width segment '{}'", segment))
                    })?)
                }
                "h" => {
                    key.height = Some(value.parse().map_err(|_| {
                        ServiceError::Validation(format!("invalid height segment '{}'", segment))
                    })?)
                }
                "f" => key.format = Some(value.to_string()),
                "q" => key.quality = Some(value.to_string()),
                "t" => key.time = Some(value.to_string()),
                "d" => key.duration = Some(value.to_string()),
                _ => unreachable!(),
            }
            path_end = index;
        }

        if path_end == 0 {
            return Err(ServiceError::Validation("cache key has empty path".to_string()));
        }
        key.source_path = segments[..path_end].join(":");
        Ok(key)
    }
}
