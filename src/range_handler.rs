//! Range Handler Module
//!
//! Parses and validates HTTP `Range` headers against a known object size and
//! builds the matching `Content-Range` values.
//!
//! Parsing is lenient in the way media players expect: a missing or garbled
//! start reads as 0, a missing end reads as the last byte, an end past the
//! object is clamped. Only a start at or past the end of the object, or a start
//! after the end, makes the request unsatisfiable.

use tracing::debug;

/// Parsed HTTP Range specification for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    /// A byte range was requested and applies to this object
    pub is_range: bool,
    pub start: u64,
    /// Inclusive
    pub end: u64,
    /// False means the caller must answer 416
    pub valid: bool,
}

impl RangeSpec {
    /// The whole object
    pub fn full(size: u64) -> Self {
        Self {
            is_range: false,
            start: 0,
            end: size.saturating_sub(1),
            valid: true,
        }
    }

    /// Number of bytes the response body carries
    pub fn content_length(&self, size: u64) -> u64 {
        if self.is_range {
            self.end - self.start + 1
        } else {
            size
        }
    }

    /// Whether a partial (206) response is due
    pub fn is_partial(&self) -> bool {
        self.is_range && self.valid
    }
}

/// Parse `header` for an object of `size` bytes.
///
/// Objects of size 0 never get range handling; the full (empty) body is served.
pub fn parse_range(header: Option<&str>, size: u64) -> RangeSpec {
    let header = match header.map(str::trim) {
        Some(h) if !h.is_empty() && size > 0 => h,
        _ => return RangeSpec::full(size),
    };

    let spec = match strip_bytes_unit(header) {
        Some(spec) if spec.contains('-') => spec,
        _ => {
            debug!("Ignoring malformed Range header: {}", header);
            return RangeSpec::full(size);
        }
    };

    let mut parts = spec.splitn(2, '-');
    let start_str = parts.next().unwrap_or("");
    let end_str = parts.next().unwrap_or("");

    let start = parse_leading_u64(start_str).unwrap_or(0);
    let end = parse_leading_u64(end_str).unwrap_or(size - 1);

    if start >= size || start > end {
        debug!(
            "Unsatisfiable range {}-{} for object of {} bytes",
            start, end, size
        );
        return RangeSpec {
            is_range: true,
            start,
            end,
            valid: false,
        };
    }

    RangeSpec {
        is_range: true,
        start,
        end: end.min(size - 1),
        valid: true,
    }
}

fn strip_bytes_unit(header: &str) -> Option<&str> {
    let (unit, rest) = header.split_once('=')?;
    if unit.trim().eq_ignore_ascii_case("bytes") {
        Some(rest.trim())
    } else {
        None
    }
}

/// Leading decimal digits of `s`, saturating at `u64::MAX`. `None` when `s`
/// does not start with a digit.
fn parse_leading_u64(s: &str) -> Option<u64> {
    let s = s.trim_start();
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    Some(s[..digits].parse::<u64>().unwrap_or(u64::MAX))
}

/// `Content-Range` value for a satisfiable partial response
pub fn content_range_header(range: &RangeSpec, size: u64) -> String {
    format!("bytes {}-{}/{}", range.start, range.end, size)
}

/// `Content-Range` value for a 416 response
pub fn unsatisfied_range_header(size: u64) -> String {
    format!("bytes */{}", size)
}
