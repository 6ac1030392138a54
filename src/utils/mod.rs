//! Small helpers shared across the triage modules.

pub mod log_rate_limiter;
pub mod text;
pub mod time;

pub use log_rate_limiter::LogRateLimiter;
pub use text::truncate_str;
pub use time::{elapsed_ms, now_timestamp_string};
