//! Pooled reqwest-backed transport implementations.

use reqwest::header;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use super::{
    body, origin_of, ContentEncoding, FetchRequest, FetchResponse, Probe, Transport,
    TransportCounters, TransportStats,
};
use crate::error::TransportError;

/// What the coordinator intends to fetch; drives pool and timeout sizing.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadShape {
    pub entry_count: usize,
    pub total_expected_bytes: u64,
}

impl WorkloadShape {
    pub fn avg_size(&self) -> u64 {
        if self.entry_count == 0 {
            0
        } else {
            self.total_expected_bytes / self.entry_count as u64
        }
    }

    /// Connections per origin, scaled to the entry count.
    pub(crate) fn pool_size(&self) -> usize {
        if self.entry_count > 10_000 {
            150
        } else if self.entry_count > 1_000 {
            100
        } else {
            50
        }
    }

    /// (total, connect) timeouts, scaled to the average entry size.
    pub(crate) fn timeouts(&self) -> (Duration, Duration) {
        let avg = self.avg_size();
        if avg > 5 * 1024 * 1024 {
            (Duration::from_secs(300), Duration::from_secs(30))
        } else if avg < 100 * 1024 {
            (Duration::from_secs(60), Duration::from_secs(10))
        } else {
            (Duration::from_secs(180), Duration::from_secs(15))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// ALPN-negotiated, HTTP/2 preferred.
    Alpn,
    /// Keep-alive HTTP/1.1 only.
    Http1Only,
}

/// One pooled client speaking either ALPN-preferred HTTP/2 or plain
/// HTTP/1.1. Two of these compose into the fallback decorator.
pub struct HttpTransport {
    client: reqwest::Client,
    counters: Arc<TransportCounters>,
}

impl HttpTransport {
    /// ALPN client: HTTP/2 where the server offers it.
    pub fn alpn(
        shape: &WorkloadShape,
        counters: Arc<TransportCounters>,
    ) -> Result<Self, TransportError> {
        Self::build(shape, counters, Flavor::Alpn)
    }

    /// HTTP/1.1-only client with keep-alive.
    pub fn http1(
        shape: &WorkloadShape,
        counters: Arc<TransportCounters>,
    ) -> Result<Self, TransportError> {
        Self::build(shape, counters, Flavor::Http1Only)
    }

    fn build(
        shape: &WorkloadShape,
        counters: Arc<TransportCounters>,
        flavor: Flavor,
    ) -> Result<Self, TransportError> {
        let (total, connect) = shape.timeouts();
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(shape.pool_size())
            .timeout(total)
            .connect_timeout(connect);
        if flavor == Flavor::Http1Only {
            builder = builder.http1_only();
        }
        let client = builder.build().map_err(TransportError::classify)?;
        Ok(HttpTransport { client, counters })
    }
}

impl Transport for HttpTransport {
    async fn probe(&self, url: &str) -> Result<Probe, TransportError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(TransportError::classify)?;

        self.counters.record_request(&origin_of(url));
        self.counters.record_version(response.version());

        let status = response.status();
        // Servers without HEAD yield a degraded probe, not a failure.
        if status == reqwest::StatusCode::METHOD_NOT_ALLOWED
            || status == reqwest::StatusCode::NOT_IMPLEMENTED
        {
            return Ok(Probe::default());
        }
        if status.is_server_error() {
            return Err(TransportError::ServerError(status.as_u16()));
        }
        if !status.is_success() {
            return Err(TransportError::BadStatus(status.as_u16()));
        }

        let headers = response.headers();
        Ok(Probe {
            supports_range: header_str(headers, header::ACCEPT_RANGES)
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes")),
            total_size: header_str(headers, header::CONTENT_LENGTH)
                .and_then(|v| v.parse().ok()),
            etag: header_str(headers, header::ETAG).map(str::to_string),
            last_modified: header_str(headers, header::LAST_MODIFIED).map(str::to_string),
        })
    }

    async fn fetch(&self, req: FetchRequest<'_>) -> Result<FetchResponse, TransportError> {
        let mut builder = self.client.get(req.url);
        if let Some(start) = req.range_start.filter(|s| *s > 0) {
            builder = builder.header(header::RANGE, format!("bytes={start}-"));
        }
        if let Some(accept) = req.accept_encoding {
            builder = builder.header(header::ACCEPT_ENCODING, accept);
        }

        let response = builder.send().await.map_err(TransportError::classify)?;

        self.counters.record_request(&origin_of(req.url));
        self.counters.record_version(response.version());

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::ServerError(status.as_u16()));
        }
        let ranged = status == reqwest::StatusCode::PARTIAL_CONTENT;
        if !ranged && status != reqwest::StatusCode::OK {
            return Err(TransportError::BadStatus(status.as_u16()));
        }

        let headers = response.headers();
        let encoding =
            ContentEncoding::from_header(header_str(headers, header::CONTENT_ENCODING));
        let total_size = if ranged {
            content_range_total(header_str(headers, header::CONTENT_RANGE))
        } else if encoding == ContentEncoding::Identity {
            header_str(headers, header::CONTENT_LENGTH).and_then(|v| v.parse().ok())
        } else {
            // Content-Length refers to the encoded body; the decoded total
            // is unknowable until the stream ends.
            None
        };
        let etag = header_str(headers, header::ETAG).map(str::to_string);
        let last_modified = header_str(headers, header::LAST_MODIFIED).map(str::to_string);

        let raw_bytes = Arc::new(AtomicU64::new(0));
        let stream = body::decoded_body(response, encoding, raw_bytes.clone());

        Ok(FetchResponse {
            status: status.as_u16(),
            ranged,
            total_size,
            encoding,
            etag,
            last_modified,
            raw_bytes,
            body: stream,
        })
    }

    async fn close(&self) {
        // reqwest tears its pool down on drop; nothing to flush here.
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

fn header_str(headers: &header::HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse the full entity size out of `Content-Range: bytes START-END/TOTAL`.
fn content_range_total(value: Option<&str>) -> Option<u64> {
    value?.rsplit('/').next()?.parse().ok()
}
