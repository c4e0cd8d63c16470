//! Log throttling
//!
//! Limits how often the same diagnostic is recorded so a wedged device or a
//! full disk does not flood the log at frame rate.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Keyed log throttler.
///
/// `should_log` returns `true` at most once per interval for a given key.
pub struct LogThrottler {
    last_logged: RwLock<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: RwLock::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check whether a message with this key should be logged now.
    ///
    /// Updates the internal timestamp when it returns `true`.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();

        {
            let last = match self.last_logged.read() {
                Ok(guard) => guard,
                Err(_) => return true,
            };
            if let Some(prev) = last.get(key) {
                if now.duration_since(*prev) < self.interval {
                    return false;
                }
            }
        }

        if let Ok(mut last) = self.last_logged.write() {
            last.insert(key.to_string(), now);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_passes_then_throttles() {
        let throttler = LogThrottler::with_secs(60);
        assert!(throttler.should_log("capture_error"));
        assert!(!throttler.should_log("capture_error"));
        // Distinct keys are throttled independently.
        assert!(throttler.should_log("segment_error"));
    }

    #[test]
    fn zero_interval_never_throttles() {
        let throttler = LogThrottler::new(Duration::ZERO);
        assert!(throttler.should_log("x"));
        assert!(throttler.should_log("x"));
    }
}
