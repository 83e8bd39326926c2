use chrono::{DateTime, Utc};

/// Layout of the `timestamp` field in response envelopes and documents
/// written by the bus, e.g. `Tue, 06 Oct 2026 08:15:00 +0000`.
pub const RESPONSE_TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S +0000";

/// Current UTC time in [`RESPONSE_TIMESTAMP_FORMAT`].
pub fn response_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(RESPONSE_TIMESTAMP_FORMAT).to_string()
}

/// Parses a timestamp produced by [`format_timestamp`].
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(input.trim(), "%a, %d %b %Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
