//! Reconnection delay policy.
//!
//! Used only by the persistent loop modes (`loop_forever`, `loop_start`).
//! Single-step callers own their retry logic.

use std::time::Duration;

use crate::error::{Error, Result};

/// Delay schedule applied between reconnection attempts.
///
/// With exponential backoff enabled the delay doubles after every failed
/// attempt, capped at `max`; otherwise it stays constant at `base`. The
/// schedule resets to `base` after any accepted handshake.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    exponential: bool,
    failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            exponential: true,
            failures: 0,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, exponential: bool) -> Result<Self> {
        if base.is_zero() {
            return Err(Error::invalid("reconnect delay must be greater than zero"));
        }
        if max < base {
            return Err(Error::invalid(
                "maximum reconnect delay must not be smaller than the base delay",
            ));
        }
        Ok(Self {
            base,
            max,
            exponential,
            failures: 0,
        })
    }

    /// Record a failed attempt and return the delay to wait before the next
    /// one, together with the upcoming attempt number.
    pub fn next_delay(&mut self) -> (u32, Duration) {
        self.failures = self.failures.saturating_add(1);
        let delay = if self.exponential {
            let doublings = (self.failures - 1).min(20);
            self.base
                .checked_mul(1u32 << doublings)
                .unwrap_or(self.max)
        } else {
            self.base
        };
        (self.failures + 1, delay.min(self.max))
    }

    /// Reset the schedule after a successful reconnect.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_schedule_doubles_up_to_cap() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(8), true).unwrap();

        assert_eq!(policy.next_delay(), (2, Duration::from_secs(1)));
        assert_eq!(policy.next_delay(), (3, Duration::from_secs(2)));
        assert_eq!(policy.next_delay(), (4, Duration::from_secs(4)));
        assert_eq!(policy.next_delay(), (5, Duration::from_secs(8)));
        assert_eq!(policy.next_delay(), (6, Duration::from_secs(8)));
    }

    #[test]
    fn constant_schedule_when_backoff_disabled() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_secs(3), Duration::from_secs(30), false).unwrap();
        for _ in 0..5 {
            let (_, delay) = policy.next_delay();
            assert_eq!(delay, Duration::from_secs(3));
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut policy = ReconnectPolicy::default();
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.next_delay().1, Duration::from_secs(1));
    }

    #[test]
    fn large_failure_counts_do_not_overflow() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(60), true).unwrap();
        for _ in 0..100 {
            let (_, delay) = policy.next_delay();
            assert!(delay <= Duration::from_secs(60));
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(ReconnectPolicy::new(Duration::ZERO, Duration::from_secs(5), true).is_err());
        assert!(
            ReconnectPolicy::new(Duration::from_secs(5), Duration::from_secs(1), true).is_err()
        );
    }

    #[test]
    fn defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.max, Duration::from_secs(30));
        assert!(policy.exponential);
    }
}
