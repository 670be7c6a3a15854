//! Incoming request envelope
//!
//! The HTTP shell parses the wire request and hands the core this view of it.

use http::{HeaderMap, Method};

/// A parsed inbound request.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    /// Absolute URL including scheme, host, path, and query.
    pub url: String,
    pub headers: HeaderMap,
}

impl IncomingRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// `scheme://host` portion of the URL.
    pub fn origin(&self) -> &str {
        origin_of(&self.url)
    }

    /// Path portion, without the query string.
    pub fn path(&self) -> &str {
        path_of(&self.url)
    }

    /// Decoded query parameters in declaration order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        query_pairs_of(&self.url)
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn has_query_param(&self, name: &str) -> bool {
        self.query_pairs().iter().any(|(k, _)| k == name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// `scheme://host` of an absolute URL; empty for relative inputs.
pub fn origin_of(url: &str) -> &str {
    let Some(scheme_end) = url.find("://") else {
        return "";
    };
    let host_start = scheme_end + 3;
    match url[host_start..].find(['/', '?']) {
        Some(offset) => &url[..host_start + offset],
        None => url,
    }
}

/// Path of an absolute or relative URL, without the query string.
pub fn path_of(url: &str) -> &str {
    let after_host = match url.find("://") {
        Some(scheme_end) => {
            let host_start = scheme_end + 3;
            match url[host_start..].find(['/', '?']) {
                Some(offset) => &url[host_start + offset..],
                None => "",
            }
        }
        None => url,
    };
    match after_host.find('?') {
        Some(query_start) => &after_host[..query_start],
        None => after_host,
    }
}

/// Percent-decoded query pairs of a URL, in declaration order.
pub fn query_pairs_of(url: &str) -> Vec<(String, String)> {
    let Some(query_start) = url.find('?') else {
        return Vec::new();
    };
    url[query_start + 1..]
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k, v),
                None => (part, ""),
            };
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    match urlencoding::decode(&plus_decoded) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => plus_decoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_extracts_scheme_and_host() {
        assert_eq!(
            origin_of("https://cdn.example.com/videos/test.mp4?w=640"),
            "https://cdn.example.com"
        );
        assert_eq!(origin_of("http://localhost:8787/a"), "http://localhost:8787");
        assert_eq!(origin_of("/videos/test.mp4"), "");
    }

    #[test]
    fn test_path_strips_query_and_host() {
        assert_eq!(
            path_of("https://cdn.example.com/videos/test.mp4?w=640&h=360"),
            "/videos/test.mp4"
        );
        assert_eq!(path_of("/videos/test.mp4?debug=true"), "/videos/test.mp4");
        assert_eq!(path_of("https://cdn.example.com"), "");
    }

    #[test]
    fn test_query_pairs_preserve_order_and_decode() {
        let pairs = query_pairs_of("/v/a.mp4?w=640&h=360&title=my%20video&flag");
        assert_eq!(
            pairs,
            vec![
                ("w".to_string(), "640".to_string()),
                ("h".to_string(), "360".to_string()),
                ("title".to_string(), "my video".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_request_helpers() {
        let request = IncomingRequest::get("https://edge.example.com/videos/clip.mp4?derivative=mobile&debug=true")
            .with_header("range", "bytes=0-99");
        assert_eq!(request.path(), "/videos/clip.mp4");
        assert_eq!(request.origin(), "https://edge.example.com");
        assert_eq!(request.query_param("derivative").as_deref(), Some("mobile"));
        assert!(request.has_query_param("debug"));
        assert_eq!(request.header_str("range"), Some("bytes=0-99"));
    }

    #[test]
    fn test_trailing_slash_variance_is_preserved() {
        assert_eq!(path_of("https://h.example.com/videos/dir/"), "/videos/dir/");
        assert_eq!(path_of("https://h.example.com/videos/dir"), "/videos/dir");
    }
}
