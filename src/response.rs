//! Response envelope shared across the core
//!
//! The shell hands us parsed requests and expects `ServiceResponse` back.
//! Bodies are either fully buffered or streamed; cache writes tee a streamed
//! body so the client sees bytes immediately while the copy fills the cache.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::error::ServiceError;

/// Boxed byte stream used for streamed bodies.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Response body. `Full` keeps the bytes in memory; `Stream` never does.
pub enum Body {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl Body {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    {
        Body::Stream(Box::pin(stream))
    }

    /// Known size without consuming the body, when available.
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Stream(_) => None,
        }
    }

    /// Drain the body into a single buffer.
    pub async fn collect(self) -> Result<Bytes, std::io::Error> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Stream(_) => write!(f, "Body::Stream"),
        }
    }
}

/// The response the core returns to the shell.
#[derive(Debug)]
pub struct ServiceResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl ServiceResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Set a header, silently dropping names or values that are not valid
    /// HTTP header tokens.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header_str("content-length")
            .and_then(|v| v.parse().ok())
            .or_else(|| self.body.len_hint())
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status.as_u16(), 200 | 206 | 304)
    }

    /// Terminal JSON error document with `X-Error-Type`.
    pub fn from_error(err: &ServiceError) -> Self {
        let body = err.to_json_body();
        let mut response = ServiceResponse::new(
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        );
        response.set_header("content-type", "application/json");
        response.set_header("content-length", &body.len().to_string());
        response.set_header("x-error-type", err.error_type());
        response.body = Body::Full(Bytes::from(body));
        response
    }
}

/// Split a body in two: the first half is handed to the client, the second
/// receives a copy of every chunk as the client consumes it. The copy is
/// driven by the client's own polling, so a slow cache writer never delays
/// the client stream.
pub fn tee_body(body: Body) -> (Body, Body) {
    match body {
        Body::Empty => (Body::Empty, Body::Empty),
        Body::Full(bytes) => (Body::Full(bytes.clone()), Body::Full(bytes)),
        Body::Stream(inner) => {
            let (tx, rx) = mpsc::unbounded();
            let teed = TeeStream { inner, tx: Some(tx) };
            (Body::from_stream(teed), Body::from_stream(rx))
        }
    }
}

struct TeeStream {
    inner: BodyStream,
    tx: Option<mpsc::UnboundedSender<Result<Bytes, std::io::Error>>>,
}

impl Stream for TeeStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(tx) = &self.tx {
                    // A dropped receiver just means the copy was abandoned.
                    let _ = tx.unbounded_send(Ok(chunk.clone()));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                if let Some(tx) = self.tx.take() {
                    let _ = tx.unbounded_send(Err(std::io::Error::new(
                        err.kind(),
                        err.to_string(),
                    )));
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                // Dropping the sender closes the copy stream.
                self.tx.take();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
