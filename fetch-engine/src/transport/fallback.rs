//! One-way HTTP/2 → HTTP/1.1 downgrade decorator.
//!
//! Wraps a preferred (ALPN, HTTP/2-capable) transport and a fallback
//! (HTTP/1.1-only) transport. The first hard protocol failure against an
//! origin marks that origin downgraded for the rest of the session; the
//! failed request is immediately re-issued on the fallback.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tracing::warn;

use super::http::{HttpTransport, WorkloadShape};
use super::{
    origin_of, FetchRequest, FetchResponse, Probe, Transport, TransportCounters, TransportStats,
};
use crate::error::TransportError;

pub struct FallbackTransport<P, F> {
    preferred: P,
    fallback: F,
    downgraded: RwLock<HashSet<String>>,
}

impl FallbackTransport<HttpTransport, HttpTransport> {
    /// The default pairing: ALPN client preferred, HTTP/1.1 keep-alive
    /// client as the landing spot. Both share one set of counters so the
    /// statistics cover the whole session.
    pub fn new(shape: &WorkloadShape) -> Result<Self, TransportError> {
        let counters = Arc::new(TransportCounters::default());
        Ok(FallbackTransport {
            preferred: HttpTransport::alpn(shape, counters.clone())?,
            fallback: HttpTransport::http1(shape, counters)?,
            downgraded: RwLock::new(HashSet::new()),
        })
    }
}

impl<P: Transport, F: Transport> FallbackTransport<P, F> {
    /// Compose arbitrary transports; used by tests to inject failures.
    pub fn with_transports(preferred: P, fallback: F) -> Self {
        FallbackTransport {
            preferred,
            fallback,
            downgraded: RwLock::new(HashSet::new()),
        }
    }

    pub fn is_downgraded(&self, origin: &str) -> bool {
        self.downgraded.read().unwrap().contains(origin)
    }

    fn downgrade(&self, origin: &str, cause: &TransportError) {
        let mut set = self.downgraded.write().unwrap();
        if set.insert(origin.to_string()) {
            warn!("downgrading {origin} to http/1.1: {cause}");
        }
    }
}

/// Hard failures that indicate the preferred protocol itself is the
/// problem: ALPN refusal, handshake errors, resets during the request.
/// Timeouts and plain connection refusals are not protocol verdicts.
fn is_downgrade_trigger(err: &TransportError) -> bool {
    match err {
        TransportError::Protocol(_) => true,
        TransportError::Connect(detail) | TransportError::Tls(detail) => {
            let lower = detail.to_ascii_lowercase();
            lower.contains("reset") || lower.contains("alpn") || lower.contains("goaway")
        }
        _ => false,
    }
}

impl<P: Transport, F: Transport> Transport for FallbackTransport<P, F> {
    async fn probe(&self, url: &str) -> Result<Probe, TransportError> {
        let origin = origin_of(url);
        if !self.is_downgraded(&origin) {
            match self.preferred.probe(url).await {
                Ok(probe) => return Ok(probe),
                Err(e) if is_downgrade_trigger(&e) => self.downgrade(&origin, &e),
                Err(e) => return Err(e),
            }
        }
        self.fallback.probe(url).await
    }

    async fn fetch(&self, req: FetchRequest<'_>) -> Result<FetchResponse, TransportError> {
        let origin = origin_of(req.url);
        if !self.is_downgraded(&origin) {
            match self.preferred.fetch(req).await {
                Ok(response) => return Ok(response),
                Err(e) if is_downgrade_trigger(&e) => self.downgrade(&origin, &e),
                Err(e) => return Err(e),
            }
        }
        self.fallback.fetch(req).await
    }

    async fn close(&self) {
        self.preferred.close().await;
        self.fallback.close().await;
    }

    /// In the default pairing both sides share counters, so the preferred
    /// transport's view covers the session.
    fn stats(&self) -> TransportStats {
        self.preferred.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Scripted transport: fails the first `fail_first` requests with a
    /// hard protocol error, then serves a fixed body.
    struct Scripted {
        fail_first: usize,
        calls: AtomicUsize,
        served: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn failure(&self) -> TransportError {
            TransportError::Protocol("GOAWAY received".to_string())
        }

        fn response(&self) -> FetchResponse {
            self.served.fetch_add(1, Ordering::SeqCst);
            FetchResponse {
                status: 200,
                ranged: false,
                total_size: Some(5),
                encoding: crate::transport::ContentEncoding::Identity,
                etag: None,
                last_modified: None,
                raw_bytes: Arc::new(AtomicU64::new(0)),
                body: futures_util::stream::iter(vec![Ok(Bytes::from_static(b"hello"))]).boxed(),
            }
        }
    }

    impl Transport for Scripted {
        async fn probe(&self, _url: &str) -> Result<Probe, TransportError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(self.failure());
            }
            Ok(Probe::default())
        }

        async fn fetch(&self, _req: FetchRequest<'_>) -> Result<FetchResponse, TransportError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(self.failure());
            }
            Ok(self.response())
        }

        async fn close(&self) {}

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn scripted(fail_first: usize) -> (Scripted, Arc<AtomicUsize>) {
        let served = Arc::new(AtomicUsize::new(0));
        (
            Scripted {
                fail_first,
                calls: AtomicUsize::new(0),
                served: served.clone(),
            },
            served,
        )
    }

    #[tokio::test]
    async fn test_hard_failure_downgrades_and_hands_off() {
        let (preferred, preferred_served) = scripted(usize::MAX);
        let (fallback, fallback_served) = scripted(0);
        let transport = FallbackTransport::with_transports(preferred, fallback);

        let req = FetchRequest {
            url: "http://cdn.test/a.bin",
            range_start: None,
            accept_encoding: None,
        };
        let response = transport.fetch(req).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(transport.is_downgraded("http://cdn.test:80"));
        assert_eq!(preferred_served.load(Ordering::SeqCst), 0);
        assert_eq!(fallback_served.load(Ordering::SeqCst), 1);

        // Subsequent requests skip the preferred transport entirely.
        let _ = transport.fetch(req).await.unwrap();
        assert_eq!(preferred_served.load(Ordering::SeqCst), 0);
        assert_eq!(fallback_served.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_downgrade_is_per_origin() {
        let (preferred, preferred_served) = scripted(1);
        let (fallback, _) = scripted(0);
        let transport = FallbackTransport::with_transports(preferred, fallback);

        let bad = FetchRequest {
            url: "http://bad.test/x",
            range_start: None,
            accept_encoding: None,
        };
        let good = FetchRequest {
            url: "http://good.test/y",
            range_start: None,
            accept_encoding: None,
        };

        let _ = transport.fetch(bad).await.unwrap();
        assert!(transport.is_downgraded("http://bad.test:80"));
        assert!(!transport.is_downgraded("http://good.test:80"));

        // The untouched origin still goes through the preferred transport.
        let _ = transport.fetch(good).await.unwrap();
        assert_eq!(preferred_served.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_protocol_errors_do_not_downgrade() {
        struct AlwaysTimeout;
        impl Transport for AlwaysTimeout {
            async fn probe(&self, _url: &str) -> Result<Probe, TransportError> {
                Err(TransportError::Timeout("slow".into()))
            }
            async fn fetch(
                &self,
                _req: FetchRequest<'_>,
            ) -> Result<FetchResponse, TransportError> {
                Err(TransportError::Timeout("slow".into()))
            }
            async fn close(&self) {}
            fn stats(&self) -> TransportStats {
                TransportStats::default()
            }
        }

        let (fallback, _) = scripted(0);
        let transport = FallbackTransport::with_transports(AlwaysTimeout, fallback);
        let req = FetchRequest {
            url: "http://slow.test/z",
            range_start: None,
            accept_encoding: None,
        };
        assert!(matches!(
            transport.fetch(req).await,
            Err(TransportError::Timeout(_))
        ));
        assert!(!transport.is_downgraded("http://slow.test:80"));
    }
}
