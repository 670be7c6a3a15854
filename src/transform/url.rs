//! Transform URL construction
//!
//! The downstream CDN transformer is addressed as
//! `<requestOrigin><basePath>/<segment>/<effectiveSourceUrl>` where the
//! segment is a comma-separated `key=value` list in stable alphabetical
//! order, omitting null-valued options.

use super::TransformOptions;

/// Serialize options into the comma-separated transform segment.
///
/// Keys appear in alphabetical order; the `derivative` name itself is not
/// sent downstream, only the dimensions it resolved to.
pub fn transform_segment(options: &TransformOptions) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(audio) = options.audio {
        parts.push(format!("audio={}", audio));
    }
    if let Some(autoplay) = options.autoplay {
        parts.push(format!("autoplay={}", autoplay));
    }
    if let Some(compression) = &options.compression {
        parts.push(format!("compression={}", compression));
    }
    if let Some(duration) = &options.duration {
        parts.push(format!("duration={}", duration));
    }
    if let Some(fit) = options.fit {
        parts.push(format!("fit={}", fit));
    }
    if let Some(format) = &options.format {
        parts.push(format!("format={}", format));
    }
    if let Some(height) = options.height {
        parts.push(format!("height={}", height));
    }
    if let Some(loop_playback) = options.loop_playback {
        parts.push(format!("loop={}", loop_playback));
    }
    if let Some(mode) = options.mode {
        parts.push(format!("mode={}", mode));
    }
    if let Some(muted) = options.muted {
        parts.push(format!("muted={}", muted));
    }
    if let Some(preload) = &options.preload {
        parts.push(format!("preload={}", preload));
    }
    if let Some(quality) = &options.quality {
        parts.push(format!("quality={}", quality));
    }
    if let Some(time) = &options.time {
        parts.push(format!("time={}", time));
    }
    if let Some(width) = options.width {
        parts.push(format!("width={}", width));
    }

    parts.join(",")
}

/// Compose the full transform URL.
pub fn build_transform_url(
    request_origin: &str,
    base_path: &str,
    options: &TransformOptions,
    effective_source_url: &str,
    cache_version: u32,
) -> String {
    let segment = transform_segment(options);
    let mut url = format!(
        "{}{}/{}/{}",
        request_origin,
        base_path.trim_end_matches('/'),
        segment,
        effective_source_url
    );
    if cache_version > 1 {
        let separator = if url.contains('?') { '&' } else { '?' };
        url.push(separator);
        url.push_str(&format!("v={}", cache_version));
    }
    url
}

/// Derive the cache tags recorded alongside a stored artifact.
///
/// Tags are opaque to the cache; observability and purge tooling key off
/// the `video-` prefix.
pub fn generate_cache_tags(source_path: &str, options: &TransformOptions) -> Vec<String> {
    let mut tags = Vec::new();

    let leaf = source_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(source_path);
    let stem = leaf.split('.').next().unwrap_or(leaf);
    if !stem.is_empty() {
        tags.push(format!("video-{}", stem));
    }

    if let Some(derivative) = &options.derivative {
        tags.push(format!("video-derivative-{}", derivative));
    }
    if let Some(format) = &options.format {
        tags.push(format!("video-format-{}", format));
    }

    tags
}
