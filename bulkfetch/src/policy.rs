//! Per-entry compression policy.
//!
//! A pure decision from (filename, expected size) to the request's
//! encoding negotiation. JSON documents compress extremely well and always
//! ask for the full encoding set; PNGs above the streaming threshold are
//! already compressed, so asking the server to recompress them only burns
//! CPU on both ends.

/// PNGs at or above this size skip encoding negotiation entirely (512 KiB).
pub const PNG_STREAM_THRESHOLD: u64 = 512 * 1024;

/// How to issue the request for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPlan {
    /// Value for the `Accept-Encoding` header, if any.
    pub accept_encoding: Option<&'static str>,
    /// Buffer the whole body before decoding instead of streaming chunks
    /// through the decoder. Only sensible for small text payloads.
    pub buffered_decode: bool,
}

/// Decide encoding negotiation for a manifest entry.
pub fn request_plan(name: &str, expected_size: Option<u64>) -> RequestPlan {
    let lower = name.to_ascii_lowercase();

    if lower.ends_with(".json") {
        return RequestPlan {
            accept_encoding: Some("gzip, br, deflate"),
            buffered_decode: true,
        };
    }

    if lower.ends_with(".png") && expected_size.unwrap_or(0) >= PNG_STREAM_THRESHOLD {
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

/// Raw-over-decoded transfer ratio for one completed file. 1.0 means the
/// wire carried as many bytes as landed on disk.
pub fn compression_ratio(raw_bytes: u64, decoded_bytes: u64) -> f64 {
    if decoded_bytes == 0 {
        return 1.0;
    }
    raw_bytes as f64 / decoded_bytes as f64
}
