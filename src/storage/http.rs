//! Outbound HTTP client
//!
//! Wraps `reqwest` behind the `HttpFetch` capability. Every attempt carries
//! the configured timeout; response bodies are exposed as streams and never
//! buffered here.

use async_trait::async_trait;
use futures::TryStreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use super::{FetchError, HttpFetch, HttpRequest};
use crate::response::{Body, ServiceResponse};

pub struct ReqwestFetcher {
    client: reqwest::Client,
    timeout_seconds: u64,
}

impl ReqwestFetcher {
    pub fn new(timeout_seconds: u64) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            timeout_seconds,
        })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn fetch(&self, request: HttpRequest) -> Result<ServiceResponse, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout_seconds)
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                value.to_str().map(HeaderValue::from_str),
            ) {
                if let Ok(value) = value {
                    headers.insert(name, value);
                }
            }
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));

        Ok(ServiceResponse {
            status,
            headers,
            body: Body::from_stream(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetcher_builds_with_timeout() {
        let fetcher = ReqwestFetcher::new(30).expect("client should build");
        assert_eq!(fetcher.timeout_seconds, 30);
    }

    #[tokio::test]
    async fn test_unroutable_host_reports_transport_error() {
        let fetcher = ReqwestFetcher::new(1).unwrap();
        let result = fetcher
            .fetch(HttpRequest::get("http://127.0.0.1:1/unreachable"))
            .await;
        assert!(matches!(result, Err(FetchError::Transport(_)) | Err(FetchError::Timeout(_))));
    }
}
