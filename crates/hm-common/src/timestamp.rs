//! Timestamp normalization.
//!
//! Export timestamps arrive as ISO 8601 strings with either a `Z` suffix or a
//! numeric UTC offset, with or without fractional seconds. They are converted
//! to UTC, truncated to milliseconds, and rendered fixed-width as
//! `YYYY-MM-DD HH:MM:SS.mmm+0000`, the text form the store's bulk-copy
//! channel accepts.

use std::borrow::Cow;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};

use crate::error::MalformedTimestamp;

/// Output layout (chrono syntax).
pub const OUTPUT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f%z";

/// Accepted input layouts, tried in order.
enum Layout {
    /// Naive layout followed by a literal `Z`.
    Zulu(&'static str),
    /// Layout ending in a numeric offset (`+0100`).
    Offset(&'static str),
}

const LAYOUTS: [Layout; 4] = [
    Layout::Zulu("%Y-%m-%dT%H:%M:%S%.f"),
    Layout::Zulu("%Y-%m-%dT%H:%M:%S"),
    Layout::Offset("%Y-%m-%dT%H:%M:%S%.f%z"),
    Layout::Offset("%Y-%m-%dT%H:%M:%S%z"),
];

/// Parse an export timestamp into a UTC instant at millisecond precision.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, MalformedTimestamp> {
    let ts = compact_offset(raw.trim());

    for layout in &LAYOUTS {
        let parsed = match layout {
            Layout::Zulu(fmt) => ts
                .strip_suffix('Z')
                .and_then(|body| NaiveDateTime::parse_from_str(body, fmt).ok())
                .map(|naive| naive.and_utc()),
            Layout::Offset(fmt) => DateTime::parse_from_str(&ts, fmt)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        };
        if let Some(dt) = parsed {
            return Ok(dt.trunc_subsecs(3));
        }
    }

    Err(MalformedTimestamp::new(raw))
}

/// Render a UTC instant in the fixed-width store layout.
pub fn render_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format(OUTPUT_FORMAT).to_string()
}

/// Parse and render in one step.
pub fn normalize(raw: &str) -> Result<String, MalformedTimestamp> {
    parse_timestamp(raw).map(|dt| render_timestamp(&dt))
}

/// Drop the colon from a trailing `±HH:MM` offset; leave anything else alone.
fn compact_offset(ts: &str) -> Cow<'_, str> {
    let b = ts.as_bytes();
    let n = b.len();
    if n < 6 {
        return Cow::Borrowed(ts);
    }
    let sign = b[n - 6];
    let is_offset = (sign == b'+' || sign == b'-')
        && b[n - 3] == b':'
        && [b[n - 5], b[n - 4], b[n - 2], b[n - 1]]
            .iter()
            .all(u8::is_ascii_digit);
    if is_offset {
        let mut out = String::with_capacity(n - 1);
        out.push_str(&ts[..n - 3]);
        out.push_str(&ts[n - 2..]);
        Cow::Owned(out)
    } else {
        Cow::Borrowed(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_with_colon() {
        assert_eq!(
            normalize("2025-05-18T10:39:36.982+01:00").unwrap(),
            "2025-05-18 09:39:36.982+0000"
        );
    }

    #[test]
    fn test_offset_without_colon() {
        assert_eq!(
            normalize("2025-05-18T10:39:36.982+0100").unwrap(),
            "2025-05-18 09:39:36.982+0000"
        );
    }

    #[test]
    fn test_negative_offset_crosses_midnight() {
        assert_eq!(
            normalize("2025-07-28T22:30:00-02:00").unwrap(),
            "2025-07-29 00:30:00.000+0000"
        );
    }

    #[test]
    fn test_zulu_with_fraction() {
        assert_eq!(
            normalize("2025-07-28T10:48:42.685Z").unwrap(),
            "2025-07-28 10:48:42.685+0000"
        );
    }

    #[test]
    fn test_zulu_without_fraction() {
        assert_eq!(
            normalize("2025-07-28T10:48:42Z").unwrap(),
            "2025-07-28 10:48:42.000+0000"
        );
    }

    #[test]
    fn test_microseconds_truncated() {
        assert_eq!(
            normalize("2025-07-28T10:48:42.6859999Z").unwrap(),
            "2025-07-28 10:48:42.685+0000"
        );
    }

    #[test]
    fn test_short_fraction_padded() {
        assert_eq!(
            normalize("2025-07-28T10:48:42.5+00:00").unwrap(),
            "2025-07-28 10:48:42.500+0000"
        );
    }

    #[test]
    fn test_malformed() {
        for raw in ["", "yesterday", "2025-07-28", "2025-07-28 10:48:42", "2025-13-01T00:00:00Z"] {
            let err = normalize(raw).unwrap_err();
            assert_eq!(err.raw, raw);
        }
    }

    #[test]
    fn test_compact_offset_only_touches_suffix() {
        assert_eq!(compact_offset("10:39:36Z"), "10:39:36Z");
        assert_eq!(compact_offset("T10:39:36+01:00"), "T10:39:36+0100");
        assert_eq!(compact_offset("+01:0"), "+01:0");
    }

    #[test]
    fn test_output_width_is_fixed() {
        let a = normalize("2025-01-01T00:00:00Z").unwrap();
        let b = normalize("2025-12-31T23:59:59.999-05:00").unwrap();
        assert_eq!(a.len(), b.len());
    }
}
