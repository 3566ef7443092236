//! Timestamp utilities

use chrono::{DateTime, SecondsFormat, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current UTC timestamp as RFC 3339 with millisecond precision
///
/// Used for every TEXT timestamp column and for observability records so that
/// lexical ordering matches chronological ordering.
pub fn now_rfc3339() -> String {
    to_rfc3339(&now())
}

/// Format a timestamp the way it is stored in the database
pub fn to_rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored RFC 3339 timestamp
pub fn parse_rfc3339(value: &str) -> crate::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::Error::Internal(format!("Invalid timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_returns_recent_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
        assert!(timestamp.timestamp() < 4_102_444_800); // 2100-01-01 00:00:00 UTC
    }

    #[test]
    fn test_rfc3339_round_trip_keeps_millis() {
        let ts = now();
        let parsed = parse_rfc3339(&to_rfc3339(&ts)).unwrap();
        assert_eq!(parsed.timestamp_millis(), ts.timestamp_millis());
    }

    #[test]
    fn test_rfc3339_sorts_lexically() {
        let earlier = parse_rfc3339("2024-01-01T00:00:00.000Z").unwrap();
        let later = parse_rfc3339("2024-01-01T00:00:01.000Z").unwrap();
        assert!(to_rfc3339(&earlier) < to_rfc3339(&later));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_rfc3339("yesterday").is_err());
    }
}
