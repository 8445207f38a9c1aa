//! Protocol-abstract HTTP transport.
//!
//! The engine talks to the network through the [`Transport`] trait:
//! `probe` (HEAD) discovers size, range support and validators; `open`
//! issues a GET and hands back headers plus a streaming byte source. The
//! trait is dyn-compatible via boxed futures so tasks can run against a
//! mock transport in tests.
//!
//! Two implementations exist: [`HttpTransport`], a reqwest-backed client
//! pinned to one protocol family, and [`FallbackTransport`], the decorator
//! that prefers HTTP/2 and permanently downgrades a host to HTTP/1.1 after
//! its first hard protocol failure.
//!
//! The transport never retries; it classifies failures and leaves policy
//! to the file task.

mod client;
mod decode;
mod fallback;

pub use client::HttpTransport;
pub use decode::{BodyDecoder, ContentEncoding};
pub use fallback::FallbackTransport;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;

/// Boxed future type for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Streaming response body: raw (still-encoded) bytes off the wire.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Transport failures, classified for the retry policy.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out")]
    Timeout,

    #[error("server error: HTTP {0}")]
    ServerError(u16),

    #[error("unexpected status: HTTP {0}")]
    BadStatus(u16),
}

impl TransportError {
    /// Whether the retry policy may try again. Client-side 4xx responses
    /// are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Connect(_)
            | TransportError::Tls(_)
            | TransportError::Protocol(_)
            | TransportError::Timeout
            | TransportError::ServerError(_) => true,
            TransportError::BadStatus(_) => false,
        }
    }
}

/// HTTP protocol family a response travelled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// Result of a HEAD probe.
#[derive(Debug, Clone, Default)]
pub struct ProbeInfo {
    /// Server advertised `Accept-Ranges: bytes`.
    pub supports_range: bool,
    /// `Content-Length`, when present.
    pub total_size: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// `Content-Encoding` the server would apply.
    pub server_encoding: Option<String>,
}

impl ProbeInfo {
    /// The freshest validator the server offered, ETag preferred.
    pub fn validator(&self) -> Option<&str> {
        self.etag.as_deref().or(self.last_modified.as_deref())
    }
}

/// Parameters for one GET.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Start offset for a `Range: bytes=N-` request.
    pub range_start: Option<u64>,
    /// `Accept-Encoding` value chosen by the compression policy.
    pub accept_encoding: Option<&'static str>,
}

/// An open response: status facts plus the raw body stream.
pub struct TransportResponse {
    pub status: u16,
    /// The server honoured a range request with `206 Partial Content`. A
    /// plain `200` against a range request means the range was ignored and
    /// the body restarts from byte zero.
    pub is_partial: bool,
    /// Length of the (possibly encoded) body, when declared.
    pub content_length: Option<u64>,
    /// Encoding applied to the body on the wire.
    pub content_encoding: ContentEncoding,
    pub protocol: Protocol,
    pub body: ByteStream,
}

/// Protocol-abstract HTTP client.
pub trait Transport: Send + Sync {
    /// HEAD probe for size, range support and validators.
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProbeInfo, TransportError>>;

    /// Open a GET, optionally ranged, returning a streaming response.
    fn open<'a>(
        &'a self,
        request: FetchRequest,
    ) -> BoxFuture<'a, Result<TransportResponse, TransportError>>;

    /// Graceful pool shutdown. Default is a no-op for pools that drain on
    /// drop.
    fn close_all(&self) {}
}

/// Connection-pool and timeout sizing derived from the workload the
/// coordinator is about to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportProfile {
    /// Idle connections kept per origin.
    pub pool_per_origin: usize,
    pub total_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportProfile {
    fn default() -> Self {
        Self {
            pool_per_origin: 50,
            total_timeout: Duration::from_secs(180),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl TransportProfile {
    /// Size the pool from entry count and timeouts from the average
    /// expected file size.
    pub fn for_workload(entry_count: usize, avg_file_size: u64) -> Self {
        let pool_per_origin = if entry_count > 10_000 {
            150
        } else if entry_count > 1_000 {
            100
        } else {
            50
        };

        let (total_timeout, connect_timeout) = if avg_file_size > 5 * 1024 * 1024 {
            (Duration::from_secs(300), Duration::from_secs(30))
        } else if avg_file_size < 100 * 1024 {
            (Duration::from_secs(60), Duration::from_secs(10))
        } else {
            (Duration::from_secs(180), Duration::from_secs(15))
        };

        Self {
            pool_per_origin,
            total_timeout,
            connect_timeout,
        }
    }
}

/// `scheme://host:port` origin of a URL, used for pool bookkeeping. Falls
/// back to the raw URL when parsing fails.
pub fn origin_of(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default();
            match parsed.port() {
                Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
                None => format!("{}://{}", parsed.scheme(), host),
            }
        }
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_scales_pool_with_entry_count() {
        assert_eq!(TransportProfile::for_workload(20_000, 0).pool_per_origin, 150);
        assert_eq!(TransportProfile::for_workload(5_000, 0).pool_per_origin, 100);
        assert_eq!(TransportProfile::for_workload(500, 0).pool_per_origin, 50);
    }

    #[test]
    fn profile_scales_timeouts_with_avg_size() {
        let large = TransportProfile::for_workload(10, 8 * 1024 * 1024);
        assert_eq!(large.total_timeout, Duration::from_secs(300));
        assert_eq!(large.connect_timeout, Duration::from_secs(30));

        let small = TransportProfile::for_workload(10, 10 * 1024);
        assert_eq!(small.total_timeout, Duration::from_secs(60));
        assert_eq!(small.connect_timeout, Duration::from_secs(10));

        let medium = TransportProfile::for_workload(10, 1024 * 1024);
        assert_eq!(medium.total_timeout, Duration::from_secs(180));
        assert_eq!(medium.connect_timeout, Duration::from_secs(15));
    }

    #[test]
    fn transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::ServerError(503).is_transient());
        assert!(TransportError::Connect("refused".into()).is_transient());
        assert!(!TransportError::BadStatus(404).is_transient());
    }

    #[test]
    fn origin_extraction() {
        assert_eq!(origin_of("https://cdn.example.com/a/b.png"), "https://cdn.example.com");
        assert_eq!(origin_of("http://localhost:8080/x"), "http://localhost:8080");
    }
}
