//! Recognition of string formats that promote a text value to a timestamp

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

static ISO_DATETIME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?$").unwrap()
});

static ISO_DATE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap()
});

/// Recognized timestamp shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    /// `2024-01-31T10:00:00Z`, offset optional
    DateTime,
    /// `2024-01-31`
    Date,
}

/// Detect whether a string is a timestamp the column can be typed as
pub fn detect_timestamp(value: &str) -> Option<TimestampFormat> {
    let len = value.len();

    // Fast path checks before the regexes
    if len < 10 || value.as_bytes()[4] != b'-' || value.as_bytes()[7] != b'-' {
        return None;
    }

    if len == 10 {
        if ISO_DATE_REGEX.is_match(value) && NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok() {
            return Some(TimestampFormat::Date);
        }
        return None;
    }

    if len >= 19 && ISO_DATETIME_REGEX.is_match(value) && parses_as_datetime(value) {
        return Some(TimestampFormat::DateTime);
    }

    None
}

pub fn is_timestamp(value: &str) -> bool {
    detect_timestamp(value).is_some()
}

/// Truncate a recognized timestamp to its calendar date
pub fn to_date(value: &str) -> Option<String> {
    match detect_timestamp(value)? {
        TimestampFormat::Date => Some(value.to_string()),
        TimestampFormat::DateTime => Some(value[..10].to_string()),
    }
}

fn parses_as_datetime(value: &str) -> bool {
    // The regex admits impossible dates like month 13
    DateTime::parse_from_rfc3339(&value.replacen(' ', "T", 1)).is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_datetime() {
        assert_eq!(detect_timestamp("2021-01-01T10:20:30Z"), Some(TimestampFormat::DateTime));
        assert_eq!(detect_timestamp("2021-01-01T10:20:30.123+02:00"), Some(TimestampFormat::DateTime));
        assert_eq!(detect_timestamp("2021-01-01 10:20:30"), Some(TimestampFormat::DateTime));
    }

    #[test]
    fn test_detect_date() {
        assert_eq!(detect_timestamp("2021-12-31"), Some(TimestampFormat::Date));
    }

    #[test]
    fn test_rejects_impossible_dates() {
        assert_eq!(detect_timestamp("2021-13-45"), None);
        assert_eq!(detect_timestamp("2021-02-30T00:00:00Z"), None);
    }

    #[test]
    fn test_rejects_plain_text() {
        assert!(!is_timestamp("hello"));
        assert!(!is_timestamp("12345-67-89"));
        assert!(!is_timestamp(""));
    }

    #[test]
    fn test_to_date() {
        assert_eq!(to_date("2024-03-05T23:59:59Z").as_deref(), Some("2024-03-05"));
        assert_eq!(to_date("2024-03-05").as_deref(), Some("2024-03-05"));
        assert_eq!(to_date("nope"), None);
    }
}
