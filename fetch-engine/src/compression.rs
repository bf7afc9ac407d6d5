//! Per-entry encoding negotiation policy.
//!
//! Pure decisions from (filename, expected size): which `Accept-Encoding`
//! to offer and whether the decoded payload may be buffered in memory
//! before hitting disk.

/// Buffered decode is only worthwhile for small documents.
const BUFFER_DECODE_CAP: u64 = 4 * 1024 * 1024;

/// Size above which PNGs are assumed incompressible enough to skip
/// negotiation entirely.
const PNG_PASSTHROUGH_MIN: u64 = 512 * 1024;

/// Request-shaping decision for one manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPlan {
    /// `Accept-Encoding` header value to send, if any.
    pub accept_encoding: Option<&'static str>,
    /// Whether the decoded body may be accumulated in memory and written
    /// in one shot instead of streamed chunk by chunk.
    pub buffered_decode: bool,
}

/// Decide encoding negotiation for an entry by suffix and expected size.
pub fn request_plan(name: &str, expected_size: Option<u64>) -> RequestPlan {
    let lower = name.to_ascii_lowercase();

    if lower.ends_with(".json") {
        // Text documents compress well; small ones can decode in memory.
        let buffered = expected_size.map_or(true, |s| s < BUFFER_DECODE_CAP);
        return RequestPlan {
            accept_encoding: Some("gzip, br, deflate"),
            buffered_decode: buffered,
        };
    }

    if lower.ends_with(".png") && expected_size.is_some_and(|s| s >= PNG_PASSTHROUGH_MIN) {
        // Already compressed; negotiating would only waste CPU.
        return RequestPlan {
            accept_encoding: None,
            buffered_decode: false,
        };
    }

    RequestPlan {
        accept_encoding: Some("gzip"),
        buffered_decode: false,
    }
}

/// Ratio of decoded bytes to raw wire bytes. 1.0 means no saving.
pub fn compression_ratio(raw_bytes: u64, decoded_bytes: u64) -> f64 {
    if raw_bytes == 0 {
        return 1.0;
    }
    decoded_bytes as f64 / raw_bytes as f64
}
