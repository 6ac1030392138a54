//! Suppresses repeats of the same warning inside a time window.
//!
//! When the oracle goes down every in-flight event fails the same way; one
//! warning per window plus a suppressed count is enough.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct KeyState {
    window_start: Instant,
    suppressed: u64,
}

#[derive(Debug, Clone)]
pub struct LogRateLimiter {
    window: Duration,
    keys: HashMap<&'static str, KeyState>,
}

impl LogRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            keys: HashMap::new(),
        }
    }

    /// `Some(n)` when a message for `key` should be logged now, where `n` is
    /// how many were swallowed since the last one; `None` to stay quiet.
    pub fn check(&mut self, key: &'static str) -> Option<u64> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&mut self, key: &'static str, now: Instant) -> Option<u64> {
        let state = match self.keys.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(KeyState {
                    window_start: now,
                    suppressed: 0,
                });
                return Some(0);
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        if now.duration_since(state.window_start) >= self.window {
            let suppressed = std::mem::take(&mut state.suppressed);
            state.window_start = now;
            return Some(suppressed);
        }

        state.suppressed += 1;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_message_passes_repeats_suppressed() {
        let mut limiter = LogRateLimiter::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert_eq!(limiter.check_at("unavailable", t0), Some(0));
        assert_eq!(limiter.check_at("unavailable", t0 + Duration::from_secs(1)), None);
        assert_eq!(limiter.check_at("unavailable", t0 + Duration::from_secs(2)), None);
        assert_eq!(
            limiter.check_at("unavailable", t0 + Duration::from_secs(11)),
            Some(2)
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let mut limiter = LogRateLimiter::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert_eq!(limiter.check_at("unavailable", t0), Some(0));
        assert_eq!(limiter.check_at("timeout", t0 + Duration::from_millis(5)), Some(0));
        assert_eq!(limiter.check_at("unavailable", t0 + Duration::from_millis(6)), None);
    }
}
