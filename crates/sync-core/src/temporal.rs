//! Canonical parsing and formatting of temporal checkpoint values.
//!
//! Checkpoints carry timestamps as text. Every value is truncated (never
//! rounded) to microsecond precision so that a value read back from a
//! checkpoint never lies past what the source column can store.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

const LOCAL_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const OFFSET_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// Drop sub-microsecond digits.
pub fn truncate_to_micros(value: NaiveDateTime) -> NaiveDateTime {
    let nanos = value.nanosecond();
    value
        .with_nanosecond(nanos - nanos % 1_000)
        .unwrap_or(value)
}

/// Parse a date-time without zone, e.g. `2025-01-20T10:30:45.123`.
pub fn parse_local_date_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    LOCAL_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(truncate_to_micros)
}

/// Parse a date-time with an offset.
///
/// Whitespace in front of the offset is tolerated (`10:30:45 Z`,
/// `10:30:45.1 -05:00`). Input without any offset is read as UTC.
pub fn parse_offset_date_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    let normalized = normalize_offset_suffix(raw.trim());

    let parsed = OFFSET_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(&normalized, format).ok())
        .or_else(|| {
            parse_local_date_time(&normalized)
                .map(|local| Utc.from_utc_datetime(&local).fixed_offset())
        })?;

    let offset = *parsed.offset();
    let local = truncate_to_micros(parsed.naive_local());
    offset.from_local_datetime(&local).single()
}

/// Parse a calendar date; a full timestamp is accepted and its date kept.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_local_date_time(raw).map(|dt| dt.date()))
}

/// `2025-01-20T10:30:45.123000`
pub fn format_local_date_time(value: &NaiveDateTime) -> String {
    truncate_to_micros(*value)
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// `2025-01-20T10:30:45.123000Z` for UTC, `2025-01-20T10:30:45.123450-05:00` otherwise.
pub fn format_offset_date_time(value: &DateTime<FixedOffset>) -> String {
    if value.offset().local_minus_utc() == 0 {
        value.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
    } else {
        value.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
    }
}

/// `2025-01-20`
pub fn format_date(value: &NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

// Removes blanks in front of the offset designator and spells `Z` as `+00:00`.
fn normalize_offset_suffix(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    for (idx, ch) in chars.iter().enumerate() {
        if ch.is_whitespace() {
            let next = chars[idx + 1..].iter().find(|c| !c.is_whitespace());
            // the date/time separator may be a blank; only drop blanks before an offset
            if matches!(next, Some('+') | Some('-') | Some('Z') | Some('z')) && idx > 10 {
                continue;
            }
        }
        out.push(*ch);
    }
    match out.strip_suffix(['Z', 'z']) {
        Some(stripped) => format!("{stripped}+00:00"),
        None => out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(raw: &str) -> String {
        format_offset_date_time(&parse_offset_date_time(raw).unwrap())
    }

    #[test]
    fn test_offset_date_time_canonical_forms() {
        let cases = [
            ("2025-01-20T10:30:45", "2025-01-20T10:30:45.000000Z"),
            ("2025-01-20T10:30:45.0", "2025-01-20T10:30:45.000000Z"),
            ("2025-01-20T10:30:45.1", "2025-01-20T10:30:45.100000Z"),
            ("2025-01-20T10:30:45.123", "2025-01-20T10:30:45.123000Z"),
            ("2025-01-20T10:30:45.123456789", "2025-01-20T10:30:45.123456Z"),
            ("2025-01-20T10:30:45.123+00:00", "2025-01-20T10:30:45.123000Z"),
            ("2025-01-20T10:30:45Z", "2025-01-20T10:30:45.000000Z"),
            ("2025-01-20T10:30:45 Z", "2025-01-20T10:30:45.000000Z"),
            (
                "2025-01-20T10:30:45.12345 -05:00",
                "2025-01-20T10:30:45.123450-05:00",
            ),
        ];
        for (raw, expected) in cases {
            assert_eq!(offset(raw), expected, "input {raw}");
        }
    }

    #[test]
    fn test_seven_digit_precision_truncates() {
        // datetime2(7) values carry 100ns ticks; the last digit must be dropped, not rounded
        let parsed = parse_local_date_time("2025-01-20T10:30:45.9999999").unwrap();
        assert_eq!(
            format_local_date_time(&parsed),
            "2025-01-20T10:30:45.999999"
        );
    }

    #[test]
    fn test_local_date_time_keeps_local_time() {
        let parsed = parse_local_date_time("2025-01-20T10:30:45.123").unwrap();
        assert_eq!(format_local_date_time(&parsed), "2025-01-20T10:30:45.123000");

        let spaced = parse_local_date_time("2025-01-20 10:30:45").unwrap();
        assert_eq!(format_local_date_time(&spaced), "2025-01-20T10:30:45.000000");
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_local_date_time("yesterday").is_none());
        assert!(parse_offset_date_time("not a timestamp").is_none());
        assert!(parse_date("2025-13-45").is_none());
    }

    #[test]
    fn test_parse_date_accepts_timestamps() {
        let date = parse_date("2025-01-20T10:30:45").unwrap();
        assert_eq!(format_date(&date), "2025-01-20");
    }
}
