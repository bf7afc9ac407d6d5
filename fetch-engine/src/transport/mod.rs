//! Protocol-abstract HTTP transport.
//!
//! The transport issues single requests and streams decoded bodies; it
//! never retries. HTTP/2 is preferred via ALPN with a one-way per-origin
//! downgrade to HTTP/1.1 on hard protocol failure, implemented as a
//! decorator over two pooled clients.

pub mod body;
pub mod fallback;
pub mod http;

pub use fallback::FallbackTransport;
pub use http::{HttpTransport, WorkloadShape};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::TransportError;

/// The transport pairing the engine constructs by default.
pub type DefaultTransport = FallbackTransport<HttpTransport, HttpTransport>;

/// Result of a HEAD probe.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    pub supports_range: bool,
    pub total_size: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Content-Encoding advertised by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Brotli,
    Deflate,
}

impl ContentEncoding {
    fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
            Some("gzip") | Some("x-gzip") => ContentEncoding::Gzip,
            Some("br") => ContentEncoding::Brotli,
            Some("deflate") => ContentEncoding::Deflate,
            _ => ContentEncoding::Identity,
        }
    }
}

/// One request to open a (possibly ranged) body stream.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    /// `Range: bytes=N-` when set and nonzero.
    pub range_start: Option<u64>,
    pub accept_encoding: Option<&'a str>,
}

/// An open response: headers of interest plus the decoded byte stream.
///
/// `raw_bytes` counts compressed wire bytes as they arrive; the decoded
/// count is whatever the caller drains from `body`.
pub struct FetchResponse {
    pub status: u16,
    /// True iff the server honored a range request with 206.
    pub ranged: bool,
    /// Full decoded entity size when the response makes it knowable
    /// (identity encoding, or the Content-Range total of a 206).
    pub total_size: Option<u64>,
    pub encoding: ContentEncoding,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub raw_bytes: Arc<AtomicU64>,
    pub body: BoxStream<'static, std::io::Result<Bytes>>,
}

/// Protocol-abstract client. One logical connection pool per origin;
/// failures carry a kind, never a retry.
pub trait Transport: Send + Sync + 'static {
    fn probe(&self, url: &str) -> impl Future<Output = Result<Probe, TransportError>> + Send;

    fn fetch(
        &self,
        req: FetchRequest<'_>,
    ) -> impl Future<Output = Result<FetchResponse, TransportError>> + Send;

    /// Graceful pool shutdown.
    fn close(&self) -> impl Future<Output = ()> + Send;

    fn stats(&self) -> TransportStats;
}

/// Read-only snapshot of transport counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub h2_requests: u64,
    pub h1_requests: u64,
    pub requests_issued: u64,
    pub origins_touched: u64,
}

impl TransportStats {
    /// Fraction of requests that reused an existing origin pool. reqwest
    /// does not expose per-connection events, so a request to an origin
    /// seen earlier in the session counts as reused.
    pub fn reuse_ratio(&self) -> f64 {
        if self.requests_issued == 0 {
            return 0.0;
        }
        1.0 - self.origins_touched as f64 / self.requests_issued as f64
    }
}

/// Shared mutable counters behind the stats snapshot.
#[derive(Default)]
pub struct TransportCounters {
    h2_requests: AtomicU64,
    h1_requests: AtomicU64,
    requests_issued: AtomicU64,
    origins: Mutex<HashSet<String>>,
    origins_touched: AtomicU64,
}

impl TransportCounters {
    pub(crate) fn record_request(&self, origin: &str) {
        self.requests_issued.fetch_add(1, Ordering::Relaxed);
        let mut origins = self.origins.lock().unwrap();
        if origins.insert(origin.to_string()) {
            self.origins_touched.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_version(&self, version: reqwest::Version) {
        if version == reqwest::Version::HTTP_2 {
            self.h2_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.h1_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            h2_requests: self.h2_requests.load(Ordering::Relaxed),
            h1_requests: self.h1_requests.load(Ordering::Relaxed),
            requests_issued: self.requests_issued.load(Ordering::Relaxed),
            origins_touched: self.origins_touched.load(Ordering::Relaxed),
        }
    }
}

/// Scheme://host:port of a URL, used as the pool and downgrade key.
pub(crate) fn origin_of(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            let host = parsed.host_str().unwrap_or("");
            match parsed.port_or_known_default() {
                Some(port) => format!("{scheme}://{host}:{port}"),
                None => format!("{scheme}://{host}"),
            }
        }
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("http://cdn.test/a/b.bin?x=1"),
            "http://cdn.test:80"
        );
        assert_eq!(
            origin_of("https://cdn.test:8443/a"),
            "https://cdn.test:8443"
        );
    }

    #[test]
    fn test_content_encoding_parse() {
        assert_eq!(
            ContentEncoding::from_header(Some("gzip")),
            ContentEncoding::Gzip
        );
        assert_eq!(
            ContentEncoding::from_header(Some("BR")),
            ContentEncoding::Brotli
        );
        assert_eq!(
            ContentEncoding::from_header(None),
            ContentEncoding::Identity
        );
        assert_eq!(
            ContentEncoding::from_header(Some("identity")),
            ContentEncoding::Identity
        );
    }

    #[test]
    fn test_reuse_ratio() {
        let counters = TransportCounters::default();
        counters.record_request("http://a.test:80");
        counters.record_request("http://a.test:80");
        counters.record_request("http://a.test:80");
        counters.record_request("http://b.test:80");

        let stats = counters.snapshot();
        assert_eq!(stats.requests_issued, 4);
        assert_eq!(stats.origins_touched, 2);
        assert!((stats.reuse_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
