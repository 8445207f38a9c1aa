//! reqwest-backed transport implementation.

use futures_util::TryStreamExt;
use reqwest::header;
use tracing::{debug, trace};

use super::{
    BoxFuture, ContentEncoding, FetchRequest, ProbeInfo, Protocol, Transport, TransportError,
    TransportProfile, TransportResponse,
};

const USER_AGENT: &str = concat!("bulkfetch/", env!("CARGO_PKG_VERSION"));

/// HTTP client pinned to one protocol family.
///
/// With `prefer_h2` the client negotiates HTTP/2 via ALPN and falls back
/// per TLS handshake; without it the client is hard-limited to HTTP/1.1
/// with keep-alive. The [`FallbackTransport`](super::FallbackTransport)
/// decorator composes one of each.
pub struct HttpTransport {
    client: reqwest::Client,
    profile: TransportProfile,
}

impl HttpTransport {
    /// Build a client for the given pool/timeout profile.
    pub fn new(profile: TransportProfile, prefer_h2: bool) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(profile.pool_per_origin)
            .timeout(profile.total_timeout)
            .connect_timeout(profile.connect_timeout)
            .tcp_keepalive(std::time::Duration::from_secs(30));

        if !prefer_h2 {
            builder = builder.http1_only();
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        Ok(Self { client, profile })
    }

    pub fn profile(&self) -> TransportProfile {
        self.profile
    }

    async fn do_probe(&self, url: &str) -> Result<ProbeInfo, TransportError> {
        trace!(url, "HEAD probe");
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::ServerError(status.as_u16()));
        }
        if !status.is_success() {
            return Err(TransportError::BadStatus(status.as_u16()));
        }

        let headers = response.headers();
        let header_str =
            |name: header::HeaderName| headers.get(&name).and_then(|v| v.to_str().ok());

        Ok(ProbeInfo {
            supports_range: header_str(header::ACCEPT_RANGES)
                .map(|v| v.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false),
            total_size: header_str(header::CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            etag: header_str(header::ETAG).map(str::to_string),
            last_modified: header_str(header::LAST_MODIFIED).map(str::to_string),
            server_encoding: header_str(header::CONTENT_ENCODING).map(str::to_string),
        })
    }

    async fn do_open(&self, request: FetchRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.get(&request.url);
        if let Some(offset) = request.range_start.filter(|o| *o > 0) {
            builder = builder.header(header::RANGE, format!("bytes={}-", offset));
        }
        // Setting Accept-Encoding by hand keeps reqwest from decoding the
        // body behind our back; the raw byte counter depends on that.
        if let Some(encoding) = request.accept_encoding {
            builder = builder.header(header::ACCEPT_ENCODING, encoding);
        }

        let response = builder.send().await.map_err(classify_reqwest)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::ServerError(status.as_u16()));
        }
        let is_partial = status.as_u16() == 206;
        if !status.is_success() {
            return Err(TransportError::BadStatus(status.as_u16()));
        }

        let protocol = match response.version() {
            reqwest::Version::HTTP_2 => Protocol::Http2,
            _ => Protocol::Http1,
        };

        let content_length = response.content_length();
        let content_encoding = ContentEncoding::from_header(
            response
                .headers()
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );

        debug!(
            url = %request.url,
            status = status.as_u16(),
            ?protocol,
            partial = is_partial,
            "response opened"
        );

        let body = response.bytes_stream().map_err(classify_reqwest);

        Ok(TransportResponse {
            status: status.as_u16(),
            is_partial,
            content_length,
            content_encoding,
            protocol,
            body: Box::pin(body),
        })
    }
}

impl Transport for HttpTransport {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProbeInfo, TransportError>> {
        Box::pin(self.do_probe(url))
    }

    fn open<'a>(
        &'a self,
        request: FetchRequest,
    ) -> BoxFuture<'a, Result<TransportResponse, TransportError>> {
        Box::pin(self.do_open(request))
    }
}

/// Map a reqwest error onto the transport failure taxonomy.
fn classify_reqwest(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout;
    }

    let detail = source_chain(&error);
    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("tls") || lowered.contains("certificate") || lowered.contains("handshake") {
        return TransportError::Tls(detail);
    }
    if error.is_connect() {
        return TransportError::Connect(detail);
    }
    TransportError::Protocol(detail)
}

/// Flatten the source chain into one message; reqwest's top-level display
/// usually hides the interesting cause.
fn source_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
