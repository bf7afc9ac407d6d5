//! Error types for the download engine.

use thiserror::Error;

/// Failures surfaced by the transport layer. The transport itself never
/// retries; the file task decides policy based on the kind.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("server error (status {0})")]
    ServerError(u16),

    #[error("unexpected status {0}")]
    BadStatus(u16),
}

impl TransportError {
    /// Whether the retry policy may re-attempt after this failure.
    /// Client-side 4xx responses are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Connect(_)
                | TransportError::Tls(_)
                | TransportError::Protocol(_)
                | TransportError::Timeout(_)
                | TransportError::ServerError(_)
        )
    }

    /// Map a reqwest error into a transport failure kind.
    pub(crate) fn classify(err: reqwest::Error) -> Self {
        let detail = err.to_string();
        if err.is_timeout() {
            return TransportError::Timeout(detail);
        }
        if err.is_connect() {
            let lower = detail.to_ascii_lowercase();
            if lower.contains("tls") || lower.contains("certificate") {
                return TransportError::Tls(detail);
            }
            return TransportError::Connect(detail);
        }
        TransportError::Protocol(detail)
    }

    /// Map a mid-body stream failure. Timeouts keep their kind so the retry
    /// policy sees them; everything else reads as a protocol-level failure.
    pub(crate) fn from_stream(err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            TransportError::Timeout(err.to_string())
        } else {
            TransportError::Protocol(err.to_string())
        }
    }
}

/// Integrity verification failures.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("digest mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("file unavailable for verification: {0}")]
    Unavailable(#[from] std::io::Error),
}

/// State store failures.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state file version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("state file corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("state file i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Manifest loading failures.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("manifest entry {name}: {reason}")]
    Entry { name: String, reason: String },
}

/// Top-level error type surfaced to the embedder.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// ENOSPC deserves a clearer message than the raw os error.
pub(crate) fn describe_io(err: &std::io::Error) -> String {
    if matches!(err.raw_os_error(), Some(28)) {
        return "disk full".to_string();
    }
    err.to_string()
}
