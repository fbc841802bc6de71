//! Publish-date normalization across the timestamp layouts feeds actually use.
//!
//! Every layout is tried in order; the first successful parse wins. Parsing
//! never fails: unknown layouts fall back to "now" so a malformed date cannot
//! stall delivery, and dates more than an hour in the future are clamped to
//! "now" so they cannot push a subscriber's watermark ahead of real time.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Dates further than this into the future are treated as bogus.
const MAX_FUTURE_SKEW_SECS: i64 = 3600;

enum Layout {
    /// Layout carries its own UTC offset.
    Zoned(&'static str),
    /// Layout has no offset; the value is taken as UTC.
    Naive(&'static str),
}

const LAYOUTS: &[Layout] = &[
    // RFC 822: Wed, 02 Oct 2002 13:00:00 +0000 ("GMT" is rewritten before matching)
    Layout::Zoned("%a, %d %b %Y %H:%M:%S %z"),
    // ISO 8601 with offset: 2002-10-02T13:00:00+00:00
    Layout::Zoned("%Y-%m-%dT%H:%M:%S%z"),
    Layout::Naive("%Y-%m-%dT%H:%M:%SZ"),
    Layout::Zoned("%Y-%m-%dT%H:%M:%S%.f%z"),
    Layout::Naive("%Y-%m-%dT%H:%M:%S%.fZ"),
    Layout::Naive("%Y-%m-%dT%H:%M:%S"),
    Layout::Naive("%Y-%m-%d %H:%M:%S"),
    Layout::Naive("%Y/%m/%d %H:%M:%S"),
];

/// Parses a feed date string into epoch seconds.
///
/// - Empty input yields `0` ("unknown").
/// - Unparsable input yields the current time and logs a warning.
/// - Results more than one hour ahead of now are replaced with now.
///
/// ```
/// use feedrelay::feed::parse_date;
///
/// assert_eq!(
///     parse_date("Wed, 02 Oct 2002 13:00:00 GMT"),
///     parse_date("2002-10-02T13:00:00Z"),
/// );
/// ```
pub fn parse_date(raw: &str) -> i64 {
    parse_date_at(raw, Utc::now().timestamp())
}

/// [`parse_date`] against an explicit "now", for deterministic callers.
pub fn parse_date_at(raw: &str, now: i64) -> i64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0;
    }
    let normalized = trimmed.replace("GMT", "+0000");

    match match_layouts(&normalized).or_else(|| rfc2822_fallback(trimmed)) {
        Some(ts) if ts > now + MAX_FUTURE_SKEW_SECS => {
            tracing::warn!(date = %trimmed, parsed = ts, now = now, "Publish date lies in the future, using current time");
            now
        }
        Some(ts) => ts,
        None => {
            tracing::warn!(date = %trimmed, "Unrecognized date format, using current time");
            now
        }
    }
}

fn match_layouts(s: &str) -> Option<i64> {
    LAYOUTS.iter().find_map(|layout| match layout {
        Layout::Zoned(fmt) => DateTime::parse_from_str(s, fmt).ok().map(|dt| dt.timestamp()),
        Layout::Naive(fmt) => NaiveDateTime::parse_from_str(s, fmt)
            .ok()
            .map(|dt| dt.and_utc().timestamp()),
    })
}

/// Catches RFC 2822 variants with named zones ("EST", "UT") the table misses.
fn rfc2822_fallback(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(s).ok().map(|dt| dt.timestamp())
}
