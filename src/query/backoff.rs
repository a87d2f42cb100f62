//! Retry pacing for GraphQL requests.
//!
//! The delay doubles after each failed attempt, capped at `max_delay`.
//! `max_attempts` counts every request, the first one included.
use std::time::Duration;

use reqwest::StatusCode;

pub struct Backoff {
    max_delay: Duration,
    multiplier: u32,
    max_attempts: u32,
    current_delay: Duration,
    /// Number of attempts made so far.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32, max_attempts: u32) -> Self {
        Self {
            max_delay,
            multiplier,
            max_attempts,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Records an attempt. Returns the delay to wait before the next one,
    /// or `None` when the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.current_delay;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);
        Some(delay)
    }
}

/// Statuses worth another attempt: rate limiting and server-side failures.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Transport errors worth another attempt.
pub fn is_transient_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_budget_spent() {
        let mut b = Backoff::new(Duration::from_millis(200), Duration::from_secs(10), 2, 4);
        assert_eq!(b.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(800)));
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempt, 4);
    }

    #[test]
    fn test_max_delay_cap() {
        let mut b = Backoff::new(Duration::from_secs(2), Duration::from_secs(5), 3, 10);
        assert_eq!(b.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_single_attempt_never_waits() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2, 1);
        assert_eq!(b.next_delay(), None);
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::OK));
    }
}
