use chrono::{DateTime, Utc};
use thiserror::Error;

/// `Mon, 02 Jan 2006 15:04:05 -0700`
const STRICT_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// A `pubDate` that neither the strict nor the tolerant parser accepted.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("unparseable date {input:?}: {strict}; tolerant parse: {tolerant}")]
pub struct DateParseError {
    pub input: String,
    pub strict: chrono::ParseError,
    pub tolerant: chrono::ParseError,
}

/// Parses an RSS `pubDate`.
///
/// Tries the fixed RFC 1123 layout with a numeric zone first, then falls back
/// to chrono's RFC 2822 parser, which also takes named zones (`GMT`, `EST`),
/// a missing weekday and single-digit days.
pub fn parse_pub_date(input: &str) -> Result<DateTime<Utc>, DateParseError> {
    let trimmed = input.trim();
    let strict = match DateTime::parse_from_str(trimmed, STRICT_FORMAT) {
        Ok(dt) => return Ok(dt.with_timezone(&Utc)),
        Err(e) => e,
    };

    DateTime::parse_from_rfc2822(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|tolerant| DateParseError {
            input: input.to_string(),
            strict,
            tolerant,
        })
}
