//! HTTP byte-range parsing and partial-content framing.
//!
//! Only a single `bytes=start-end` or `bytes=start-` range is accepted.
//! Suffix ranges (`bytes=-500`) and multi-range sets are rejected.

use crate::OfflineError;
use http::header::{HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE};

const BYTES_PREFIX: &str = "bytes=";

/// A parsed, not yet resolved, byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte, inclusive.
    pub start: u64,
    /// Last byte, inclusive; `None` means to end of file.
    pub end: Option<u64>,
}

/// A byte range resolved against an object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    /// First byte, inclusive.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: u64,
    /// Size of the whole object.
    pub total_size: u64,
}

/// Parse a `Range` header value.
///
/// # Errors
/// `InvalidRange` when the header is empty, does not use the `bytes=` unit,
/// lacks a start, has non-numeric bounds, or has `start > end`.
pub fn parse_range_header(header: &str) -> Result<ByteRange, OfflineError> {
    if header.is_empty() {
        return Err(OfflineError::InvalidRange("empty header".to_string()));
    }

    let range_set = header
        .strip_prefix(BYTES_PREFIX)
        .ok_or_else(|| OfflineError::InvalidRange(format!("unsupported unit in {:?}", header)))?;

    let mut parts = range_set.split('-');
    let (Some(start_str), Some(end_str), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(OfflineError::InvalidRange(format!(
            "expected start-end in {:?}",
            header
        )));
    };

    if start_str.is_empty() {
        return Err(OfflineError::InvalidRange("missing start".to_string()));
    }

    let start = parse_bound(start_str)?;
    let end = if end_str.is_empty() {
        None
    } else {
        Some(parse_bound(end_str)?)
    };

    if let Some(end) = end {
        if start > end {
            return Err(OfflineError::InvalidRange(format!(
                "start {} after end {}",
                start, end
            )));
        }
    }

    Ok(ByteRange { start, end })
}

fn parse_bound(s: &str) -> Result<u64, OfflineError> {
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(OfflineError::InvalidRange(format!("non-numeric bound {:?}", s)));
    }
    s.parse::<u64>()
        .map_err(|e| OfflineError::InvalidRange(format!("bad bound {:?}: {}", s, e)))
}

impl ByteRange {
    /// Resolve against an object of `total_size` bytes.
    ///
    /// The end is clamped to `total_size - 1` when open or out of bounds.
    ///
    /// # Errors
    /// `InvalidRange` when the object is empty or `start` lies past its end.
    pub fn resolve(self, total_size: u64) -> Result<ResolvedRange, OfflineError> {
        if total_size == 0 {
            return Err(OfflineError::InvalidRange("object is empty".to_string()));
        }
        let last = total_size - 1;
        let end = self.end.map_or(last, |e| e.min(last));
        if self.start > end {
            return Err(OfflineError::InvalidRange(format!(
                "start {} beyond object size {}",
                self.start, total_size
            )));
        }
        Ok(ResolvedRange {
            start: self.start,
            end,
            total_size,
        })
    }
}

impl ResolvedRange {
    /// Bytes covered by the range.
    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total_size)
    }

    /// Write partial-content framing headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.content_length()));
        if let Ok(value) = HeaderValue::from_str(&self.content_range()) {
            headers.insert(CONTENT_RANGE, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_closed_range() {
        let range = parse_range_header("bytes=0-999").unwrap();
        assert_eq!(range, ByteRange { start: 0, end: Some(999) });
    }

    #[test]
    fn test_parse_open_range() {
        let range = parse_range_header("bytes=100-").unwrap();
        assert_eq!(range, ByteRange { start: 100, end: None });
    }

    #[test]
    fn test_parse_rejects_inverted() {
        assert!(matches!(
            parse_range_header("bytes=1000-500"),
            Err(OfflineError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_parse_rejects_other_units() {
        assert!(matches!(
            parse_range_header("chars=0-100"),
            Err(OfflineError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(parse_range_header("").is_err());
        assert!(parse_range_header("bytes=").is_err());
    }

    #[test]
    fn test_parse_rejects_suffix_and_garbage() {
        assert!(parse_range_header("bytes=-500").is_err());
        assert!(parse_range_header("bytes=a-10").is_err());
        assert!(parse_range_header("bytes=0-1-2").is_err());
        assert!(parse_range_header("bytes=0-10,20-30").is_err());
        assert!(parse_range_header("bytes=+5-10").is_err());
    }

    #[test]
    fn test_resolve_clamps_end() {
        let resolved = ByteRange { start: 100, end: Some(10_000) }.resolve(1000).unwrap();
        assert_eq!(resolved.end, 999);
        assert_eq!(resolved.content_length(), 900);
        assert_eq!(resolved.content_range(), "bytes 100-999/1000");
    }

    #[test]
    fn test_resolve_open_end() {
        let resolved = parse_range_header("bytes=100-").unwrap().resolve(1000).unwrap();
        assert_eq!((resolved.start, resolved.end), (100, 999));
    }

    #[test]
    fn test_resolve_start_past_eof() {
        let result = ByteRange { start: 1000, end: None }.resolve(1000);
        assert!(matches!(result, Err(OfflineError::InvalidRange(_))));
    }

    #[test]
    fn test_headers_written() {
        let resolved = ByteRange { start: 0, end: Some(99) }.resolve(500).unwrap();
        let mut headers = HeaderMap::new();
        resolved.apply_headers(&mut headers);
        assert_eq!(headers[CONTENT_RANGE], "bytes 0-99/500");
        assert_eq!(headers[CONTENT_LENGTH], "100");
        assert_eq!(headers[ACCEPT_RANGES], "bytes");
    }

    proptest! {
        #[test]
        fn prop_resolved_range_stays_inside_object(
            start in 0u64..10_000,
            len in proptest::option::of(0u64..20_000),
            total in 1u64..10_000,
        ) {
            let range = ByteRange { start, end: len.map(|l| start + l) };
            match range.resolve(total) {
                Ok(resolved) => {
                    prop_assert!(resolved.end < total);
                    prop_assert!(resolved.start <= resolved.end);
                    prop_assert_eq!(resolved.content_length(), resolved.end - resolved.start + 1);
                }
                Err(_) => prop_assert!(start >= total),
            }
        }

        #[test]
        fn prop_parse_never_panics(header in ".{0,40}") {
            let _ = parse_range_header(&header);
        }
    }
}
