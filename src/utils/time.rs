//! Time helpers.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn now_timestamp_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Milliseconds between two instants, zero if `end` precedes `start`
pub fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
