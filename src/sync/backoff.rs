//! Reconnect backoff policy for mailbox supervisors

use std::time::Duration;

const INITIAL: Duration = Duration::from_secs(1);
const FACTOR: f64 = 1.5;
const MAX: Duration = Duration::from_secs(120);
/// Transient folder-processing errors skip the growing schedule
const FOLDER_RETRY: Duration = Duration::from_secs(5);

/// Exponential backoff: 1 s, 1.5 s, 2.25 s, ... capped at 2 min.
/// Reset on every successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self { current: INITIAL }
    }

    /// Delay to wait before the next attempt; grows the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.as_secs_f64() * FACTOR;
        self.current = Duration::from_secs_f64(grown.min(MAX.as_secs_f64()));
        delay
    }

    pub fn reset(&mut self) {
        self.current = INITIAL;
    }

    /// Fixed short delay for transient errors inside an established session
    pub fn folder_retry() -> Duration {
        FOLDER_RETRY
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_grows_by_half() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2250));
    }

    #[test]
    fn test_schedule_caps_at_two_minutes() {
        let mut backoff = Backoff::new();
        for _ in 0..32 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(120));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_folder_retry_is_five_seconds() {
        assert_eq!(Backoff::folder_retry(), Duration::from_secs(5));
    }
}
