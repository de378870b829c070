use chrono::{SecondsFormat, Utc};

/// Wall-clock timestamp in RFC 3339 UTC with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds since a stored RFC 3339 timestamp, or `None` when unparsable.
pub fn millis_since(timestamp: &str) -> Option<i64> {
    let then = chrono::DateTime::parse_from_rfc3339(timestamp).ok()?;
    Some(Utc::now().signed_duration_since(then).num_milliseconds())
}

/// Random lowercase hex of the requested length, at most 32 characters.
pub fn hex_suffix(len: usize) -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(len)
        .collect()
}
