//! Reconnect backoff tracker.
//!
//! Same shape as the attempt counter the WebSocket reconnect loop this code
//! is modeled on keeps, but the delay formula is the wire spec's own:
//! `min(attempt * reconnect_delay_factor, max_reconnect_delay)` plus a
//! sub-second jitter so many connections don't retry in lockstep.

use std::time::Duration;

use crate::options::ConnectionOptions;

/// Tracks reconnect attempts for a single connection and computes the next
/// backoff delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempts: u32,
    delay_factor: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
}

impl Backoff {
    /// Build a tracker from connection options, starting at zero attempts.
    pub fn new(options: &ConnectionOptions) -> Self {
        Self {
            attempts: 0,
            delay_factor: options.reconnect_delay_factor,
            max_delay: options.max_reconnect_delay,
            max_attempts: options.max_reconnect_attempts,
        }
    }

    /// Reset the attempt counter after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Number of consecutive failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True if the next attempt would exceed the configured maximum.
    pub fn exhausted(&self) -> bool {
        matches!(self.max_attempts, Some(max) if self.attempts + 1 >= max)
    }

    /// Record a failed attempt and compute the delay before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        let base = self.delay_factor.saturating_mul(self.attempts).min(self.max_delay);
        let jitter = Duration::from_millis(rand::random::<u64>() % 1000);
        base + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            reconnect_delay_factor: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_millis(500),
            max_reconnect_attempts: Some(5),
            ..Default::default()
        }
    }

    #[test]
    fn delay_grows_with_attempts_and_caps() {
        let mut backoff = Backoff::new(&options());
        let d1 = backoff.next_delay();
        assert!(d1 >= Duration::from_millis(100) && d1 < Duration::from_millis(1100));
        let d2 = backoff.next_delay();
        assert!(d2 >= Duration::from_millis(200));
        for _ in 0..10 {
            backoff.next_delay();
        }
        // capped base is 500ms, plus up to ~1s jitter.
        assert!(backoff.next_delay() < Duration::from_millis(1600));
    }

    #[test]
    fn exhausted_once_attempts_reach_max() {
        let mut backoff = Backoff::new(&options());
        for _ in 0..4 {
            assert!(!backoff.exhausted());
            backoff.next_delay();
        }
        assert!(backoff.exhausted());
    }

    #[test]
    fn reset_clears_attempt_count() {
        let mut backoff = Backoff::new(&options());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }
}
