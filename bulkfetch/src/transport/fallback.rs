//! HTTP/2 → HTTP/1.1 downgrade decorator.
//!
//! Wraps an ALPN-negotiating client and a plain HTTP/1.1 client. A host
//! that produces a hard protocol failure (ALPN refusal, handshake error,
//! connection reset on its first request) is downgraded permanently for
//! the session: the failed call is reissued on HTTP/1.1 and every later
//! request to that host skips HTTP/2 entirely. The downgrade is one-way.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::warn;

use super::{
    BoxFuture, FetchRequest, HttpTransport, ProbeInfo, Transport, TransportError, TransportProfile,
    TransportResponse,
};

/// Protocol-negotiating transport with per-host one-way downgrade.
pub struct FallbackTransport {
    primary: HttpTransport,
    fallback: HttpTransport,
    downgraded: Mutex<HashSet<String>>,
}

impl FallbackTransport {
    pub fn new(profile: TransportProfile) -> Result<Self, TransportError> {
        Ok(Self {
            primary: HttpTransport::new(profile, true)?,
            fallback: HttpTransport::new(profile, false)?,
            downgraded: Mutex::new(HashSet::new()),
        })
    }

    /// Hosts downgraded so far this session.
    pub fn downgraded_hosts(&self) -> Vec<String> {
        self.downgraded.lock().iter().cloned().collect()
    }

    fn is_downgraded(&self, host: &str) -> bool {
        self.downgraded.lock().contains(host)
    }

    fn downgrade(&self, host: &str, error: &TransportError) {
        let newly = self.downgraded.lock().insert(host.to_string());
        if newly {
            warn!(host, %error, "downgrading host to HTTP/1.1");
        }
    }
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Failures that condemn the HTTP/2 path for a host. Timeouts and HTTP
/// status errors are not protocol problems and must not trigger a
/// downgrade.
fn is_hard_protocol_failure(error: &TransportError) -> bool {
    match error {
        TransportError::Protocol(_) | TransportError::Tls(_) => true,
        TransportError::Connect(detail) => {
            let lowered = detail.to_ascii_lowercase();
            lowered.contains("reset") || lowered.contains("goaway")
        }
        _ => false,
    }
}

impl Transport for FallbackTransport {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProbeInfo, TransportError>> {
        Box::pin(async move {
            let host = host_of(url);
            if self.is_downgraded(&host) {
                return self.fallback.probe(url).await;
            }
            match self.primary.probe(url).await {
                Err(error) if is_hard_protocol_failure(&error) => {
                    self.downgrade(&host, &error);
                    self.fallback.probe(url).await
                }
                other => other,
            }
        })
    }

    fn open<'a>(
        &'a self,
        request: FetchRequest,
    ) -> BoxFuture<'a, Result<TransportResponse, TransportError>> {
        Box::pin(async move {
            let host = host_of(&request.url);
            if self.is_downgraded(&host) {
                return self.fallback.open(request).await;
            }
            match self.primary.open(request.clone()).await {
                Err(error) if is_hard_protocol_failure(&error) => {
                    self.downgrade(&host, &error);
                    self.fallback.open(request).await
                }
                other => other,
            }
        })
    }
}
