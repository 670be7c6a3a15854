//! Transformation options
//!
//! `TransformOptions` is the fully resolved parameter set handed to the
//! transform invoker. Resolution layers option sources from lowest to
//! highest precedence: static defaults, path-pattern overrides, origin
//! overrides, derivative presets, then explicit caller options. A derivative's
//! dimensions are authoritative and replace explicit width/height.

pub mod invoker;
pub mod url;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{DerivativeConfig, TransformOverrides, ValidOptions};
use crate::error::ServiceError;

/// Output mode of a transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Video,
    Frame,
    Spritesheet,
    Audio,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Video => write!(f, "video"),
            Mode::Frame => write!(f, "frame"),
            Mode::Spritesheet => write!(f, "spritesheet"),
            Mode::Audio => write!(f, "audio"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Mode::Video),
            "frame" => Ok(Mode::Frame),
            "spritesheet" => Ok(Mode::Spritesheet),
            "audio" => Ok(Mode::Audio),
            other => Err(ServiceError::Validation(format!("invalid mode '{}'", other))),
        }
    }
}

/// Fit behavior when both dimensions are given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fit {
    Contain,
    ScaleDown,
    Cover,
}

impl fmt::Display for Fit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fit::Contain => write!(f, "contain"),
            Fit::ScaleDown => write!(f, "scale-down"),
            Fit::Cover => write!(f, "cover"),
        }
    }
}

impl std::str::FromStr for Fit {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contain" => Ok(Fit::Contain),
            "scale-down" => Ok(Fit::ScaleDown),
            "cover" => Ok(Fit::Cover),
            other => Err(ServiceError::Validation(format!("invalid fit '{}'", other))),
        }
    }
}

/// Smallest accepted dimension in pixels.
pub const MIN_DIMENSION: u32 = 10;
/// Largest accepted dimension in pixels.
pub const MAX_DIMENSION: u32 = 2000;

/// The fully resolved transformation parameter set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mode: Option<Mode>,
    pub fit: Option<Fit>,
    pub format: Option<String>,
    pub time: Option<String>,
    pub duration: Option<String>,
    pub quality: Option<String>,
    pub compression: Option<String>,
    #[serde(rename = "loop")]
    pub loop_playback: Option<bool>,
    pub preload: Option<String>,
    pub autoplay: Option<bool>,
    pub muted: Option<bool>,
    pub audio: Option<bool>,
    /// Named preset; when set, its dimensions take precedence.
    pub derivative: Option<String>,
}

impl TransformOptions {
    /// Parse caller options from decoded query pairs. Unrecognized
    /// parameters are ignored so they pass through untouched.
    pub fn from_query_pairs(pairs: &[(String, String)]) -> Result<Self, ServiceError> {
        let mut options = TransformOptions::default();
        for (key, value) in pairs {
            match key.as_str() {
                "width" | "w" => options.width = Some(parse_dimension(key, value)?),
                "height" | "h" => options.height = Some(parse_dimension(key, value)?),
                "mode" => options.mode = Some(value.parse()?),
                "fit" => options.fit = Some(value.parse()?),
                "format" | "f" => options.format = Some(value.clone()),
                "time" | "t" => options.time = Some(value.clone()),
                "duration" | "d" => options.duration = Some(value.clone()),
                "quality" | "q" => options.quality = Some(value.clone()),
                "compression" => options.compression = Some(value.clone()),
                "loop" => options.loop_playback = Some(parse_bool(key, value)?),
                "preload" => options.preload = Some(value.clone()),
                "autoplay" => options.autoplay = Some(parse_bool(key, value)?),
                "muted" => options.muted = Some(parse_bool(key, value)?),
                "audio" => options.audio = Some(parse_bool(key, value)?),
                "derivative" => options.derivative = Some(value.clone()),
                _ => {}
            }
        }
        Ok(options)
    }

    /// Overlay every populated field of `overrides` onto `self`.
    pub fn apply_overrides(&mut self, overrides: &TransformOverrides) {
        if let Some(width) = overrides.width {
            self.width = Some(width);
        }
        if let Some(height) = overrides.height {
            self.height = Some(height);
        }
        if let Some(mode) = overrides.mode {
            self.mode = Some(mode);
        }
        if let Some(fit) = overrides.fit {
            self.fit = Some(fit);
        }
        if let Some(format) = &overrides.format {
            self.format = Some(format.clone());
        }
        if let Some(quality) = &overrides.quality {
            self.quality = Some(quality.clone());
        }
        if let Some(compression) = &overrides.compression {
            self.compression = Some(compression.clone());
        }
        if let Some(time) = &overrides.time {
            self.time = Some(time.clone());
        }
        if let Some(duration) = &overrides.duration {
            self.duration = Some(duration.clone());
        }
        if let Some(loop_playback) = overrides.loop_playback {
            self.loop_playback = Some(loop_playback);
        }
        if let Some(preload) = &overrides.preload {
            self.preload = Some(preload.clone());
        }
        if let Some(autoplay) = overrides.autoplay {
            self.autoplay = Some(autoplay);
        }
        if let Some(muted) = overrides.muted {
            self.muted = Some(muted);
        }
        if let Some(audio) = overrides.audio {
            self.audio = Some(audio);
        }
    }

    fn apply_derivative(&mut self, derivative: &DerivativeConfig) {
        if let Some(width) = derivative.width {
            self.width = Some(width);
        }
        if let Some(height) = derivative.height {
            self.height = Some(height);
        }
        if let Some(mode) = derivative.mode {
            self.mode = Some(mode);
        }
        if let Some(format) = &derivative.format {
            self.format = Some(format.clone());
        }
        if let Some(quality) = &derivative.quality {
            self.quality = Some(quality.clone());
        }
        if let Some(compression) = &derivative.compression {
            self.compression = Some(compression.clone());
        }
        if let Some(duration) = &derivative.duration {
            self.duration = Some(duration.clone());
        }
        if let Some(audio) = derivative.audio {
            self.audio = Some(audio);
        }
    }

    /// Check enum membership and dimension ranges against the configured
    /// valid-option lists.
    pub fn validate(&self, valid: &ValidOptions) -> Result<(), ServiceError> {
        for (label, dimension) in [("width", self.width), ("height", self.height)] {
            if let Some(value) = dimension {
                if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
                    return Err(ServiceError::Validation(format!(
                        "{} {} out of range {}..={}",
                        label, value, MIN_DIMENSION, MAX_DIMENSION
                    )));
                }
            }
        }
        if let Some(format) = &self.format {
            if !valid.formats.iter().any(|f| f == format) {
                return Err(ServiceError::Validation(format!("invalid format '{}'", format)));
            }
        }
        if let Some(quality) = &self.quality {
            if !valid.qualities.iter().any(|q| q == quality) {
                return Err(ServiceError::Validation(format!("invalid quality '{}'", quality)));
            }
        }
        if let Some(compression) = &self.compression {
            if !valid.compressions.iter().any(|c| c == compression) {
                return Err(ServiceError::Validation(format!(
                    "invalid compression '{}'",
                    compression
                )));
            }
        }
        if let Some(preload) = &self.preload {
            if !valid.preloads.iter().any(|p| p == preload) {
                return Err(ServiceError::Validation(format!("invalid preload '{}'", preload)));
            }
        }
        Ok(())
    }

    /// Stable one-line rendering used for etag hashing and diagnostics.
    pub fn summary(&self) -> String {
        url::transform_segment(self)
    }
}

fn parse_dimension(key: &str, value: &str) -> Result<u32, ServiceError> {
    value
        .parse()
        .map_err(|_| ServiceError::Validation(format!("parameter '{}' must be an integer", key)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ServiceError> {
    match value {
        "true" | "1" | "" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ServiceError::Validation(format!(
            "parameter '{}' must be a boolean, got '{}'",
            key, other
        ))),
    }
}

/// Inputs to option resolution, lowest precedence first.
#[derive(Default)]
pub struct ResolutionInputs<'a> {
    pub defaults: Option<&'a TransformOverrides>,
    pub pattern_overrides: Option<&'a TransformOverrides>,
    pub origin_overrides: Option<&'a TransformOverrides>,
    pub origin_quality: Option<&'a str>,
    pub origin_compression: Option<&'a str>,
    pub derivative: Option<&'a DerivativeConfig>,
}

/// Resolve the effective options for a request.
///
/// The caller's explicit options win over everything except a derivative's
/// dimensions, which replace explicit width/height when a derivative is set.
pub fn resolve_options(
    caller: &TransformOptions,
    inputs: &ResolutionInputs<'_>,
) -> TransformOptions {
    let mut resolved = TransformOptions::default();

    if let Some(defaults) = inputs.defaults {
        resolved.apply_overrides(defaults);
    }
    if let Some(pattern) = inputs.pattern_overrides {
        resolved.apply_overrides(pattern);
    }
    if let Some(origin) = inputs.origin_overrides {
        resolved.apply_overrides(origin);
    }
    if let Some(quality) = inputs.origin_quality {
        resolved.quality = Some(quality.to_string());
    }
    if let Some(compression) = inputs.origin_compression {
        resolved.compression = Some(compression.to_string());
    }
    if let Some(derivative) = inputs.derivative {
        resolved.apply_derivative(derivative);
    }

    // Caller options layer on top of everything resolved so far.
    let caller_clone = caller.clone();
    if let Some(width) = caller_clone.width {
        resolved.width = Some(width);
    }
    if let Some(height) = caller_clone.height {
        resolved.height = Some(height);
    }
    if let Some(mode) = caller_clone.mode {
        resolved.mode = Some(mode);
    }
    if let Some(fit) = caller_clone.fit {
        resolved.fit = Some(fit);
    }
    if let Some(format) = caller_clone.format {
        resolved.format = Some(format);
    }
    if let Some(time) = caller_clone.time {
        resolved.time = Some(time);
    }
    if let Some(duration) = caller_clone.duration {
        resolved.duration = Some(duration);
    }
    if let Some(quality) = caller_clone.quality {
        resolved.quality = Some(quality);
    }
    if let Some(compression) = caller_clone.compression {
        resolved.compression = Some(compression);
    }
    if let Some(loop_playback) = caller_clone.loop_playback {
        resolved.loop_playback = Some(loop_playback);
    }
    if let Some(preload) = caller_clone.preload {
        resolved.preload = Some(preload);
    }
    if let Some(autoplay) = caller_clone.autoplay {
        resolved.autoplay = Some(autoplay);
    }
    if let Some(muted) = caller_clone.muted {
        resolved.muted = Some(muted);
    }
    if let Some(audio) = caller_clone.audio {
        resolved.audio = Some(audio);
    }
    resolved.derivative = caller_clone.derivative.clone();

    // The derivative's dimensions are authoritative over explicit w/h.
    if caller.derivative.is_some() {
        if let Some(derivative) = inputs.derivative {
            if derivative.width.is_some() {
                resolved.width = derivative.width;
            }
            if derivative.height.is_some() {
                resolved.height = derivative.height;
            }
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(input: &[(&str, &str)]) -> Vec<(String, String)> {
        input
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parses_short_and_long_query_forms() {
        let options =
            TransformOptions::from_query_pairs(&pairs(&[("w", "640"), ("height", "360")]))
                .unwrap();
        assert_eq!(options.width, Some(640));
        assert_eq!(options.height, Some(360));
    }

    #[test]
    fn test_rejects_non_numeric_dimension() {
        let result = TransformOptions::from_query_pairs(&pairs(&[("w", "wide")]));
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    #[test]
    fn test_unknown_query_params_are_ignored() {
        let options =
            TransformOptions::from_query_pairs(&pairs(&[("utm_source", "mail"), ("w", "100")]))
                .unwrap();
        assert_eq!(options.width, Some(100));
    }

    #[test]
    fn test_mode_and_fit_parse_wire_names() {
        let options = TransformOptions::from_query_pairs(&pairs(&[
            ("mode", "frame"),
            ("fit", "scale-down"),
        ]))
        .unwrap();
        assert_eq!(options.mode, Some(Mode::Frame));
        assert_eq!(options.fit, Some(Fit::ScaleDown));
    }

    #[test]
    fn test_caller_options_beat_origin_overrides() {
        let origin_overrides = TransformOverrides {
            width: Some(320),
            quality: Some("low".into()),
            ..Default::default()
        };
        let caller = TransformOptions {
            width: Some(1280),
            ..Default::default()
        };
        let resolved = resolve_options(
            &caller,
            &ResolutionInputs {
                origin_overrides: Some(&origin_overrides),
                ..Default::default()
            },
        );
        assert_eq!(resolved.width, Some(1280), "caller width wins");
        assert_eq!(resolved.quality.as_deref(), Some("low"), "origin quality survives");
    }

    #[test]
    fn test_derivative_dimensions_replace_explicit_ones() {
        let derivative = DerivativeConfig {
            width: Some(854),
            height: Some(640),
            ..Default::default()
        };
        let caller = TransformOptions {
            width: Some(1920),
            height: Some(1080),
            derivative: Some("mobile".into()),
            ..Default::default()
        };
        let resolved = resolve_options(
            &caller,
            &ResolutionInputs {
                derivative: Some(&derivative),
                ..Default::default()
            },
        );
        assert_eq!(resolved.width, Some(854));
        assert_eq!(resolved.height, Some(640));
        assert_eq!(resolved.derivative.as_deref(), Some("mobile"));
    }

    #[test]
    fn test_validate_enforces_dimension_range() {
        let valid = ValidOptions::default();
        let too_small = TransformOptions {
            width: Some(4),
            ..Default::default()
        };
        assert!(too_small.validate(&valid).is_err());

        let too_large = TransformOptions {
            height: Some(5000),
            ..Default::default()
        };
        assert!(too_large.validate(&valid).is_err());

        let fine = TransformOptions {
            width: Some(640),
            height: Some(360),
            ..Default::default()
        };
        assert!(fine.validate(&valid).is_ok());
    }

    #[test]
    fn test_validate_checks_enum_membership() {
        let valid = ValidOptions::default();
        let bad_format = TransformOptions {
            format: Some("mkv".into()),
            ..Default::default()
        };
        assert!(bad_format.validate(&valid).is_err());

        let good_format = TransformOptions {
            format: Some("mp4".into()),
            ..Default::default()
        };
        assert!(good_format.validate(&valid).is_ok());
    }
}
