//! Receive-side error accounting.
//!
//! `ErrorState` tracks consecutive receive failures and the exponential retry
//! delay. It never sleeps itself; the ingestor decides what to do with the
//! `Recovery` it returns.

use std::time::Duration;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_THRESHOLD: u32 = 10;
pub const DEFAULT_IDLE_TICK: Duration = Duration::from_millis(10);
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Timing and threshold knobs for the receive loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure, and the value restored on reset.
    pub initial_delay: Duration,
    /// Ceiling for the doubled delay.
    pub max_delay: Duration,
    /// Consecutive failures that trigger a reconnect.
    pub reconnect_threshold: u32,
    /// Sleep between polls when no message is waiting.
    pub idle_tick: Duration,
    /// Receive timeout configured on the subscriber connection.
    pub recv_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            reconnect_threshold: DEFAULT_RECONNECT_THRESHOLD,
            idle_tick: DEFAULT_IDLE_TICK,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }
}

/// What the receive loop should do after a counted failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// Sleep for the given delay and poll again on the same connection.
    Backoff(Duration),
    /// Replace the connection.
    Reconnect,
}

/// Consecutive error count and current retry delay.
///
/// `retry_delay` stays within `[initial_delay, max_delay]`.
#[derive(Clone, Debug)]
pub struct ErrorState {
    policy: RetryPolicy,
    consecutive_errors: u32,
    retry_delay: Duration,
}

impl ErrorState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            consecutive_errors: 0,
            retry_delay: policy.initial_delay,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Forget all failures. Called on a successful receive or reconnect.
    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.retry_delay = self.policy.initial_delay;
    }

    /// Count one failure and decide how to recover from it.
    ///
    /// Below the threshold this also advances the backoff, so the returned
    /// delay is the one to sleep now.
    pub fn record_error(&mut self) -> Recovery {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.consecutive_errors >= self.policy.reconnect_threshold {
            Recovery::Reconnect
        } else {
            Recovery::Backoff(self.next_delay())
        }
    }

    /// Current delay, doubling the stored one up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.retry_delay;
        self.retry_delay = current.saturating_mul(2).min(self.policy.max_delay);
        current
    }
}

impl Default for ErrorState {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_ceiling() {
        let mut state = ErrorState::default();
        let mut seen = Vec::new();
        for _ in 0..9 {
            match state.record_error() {
                Recovery::Backoff(delay) => seen.push(delay.as_millis()),
                Recovery::Reconnect => panic!("reconnect below threshold"),
            }
        }
        assert_eq!(seen, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000, 5000]);
        assert_eq!(state.retry_delay(), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn tenth_error_requests_reconnect() {
        let mut state = ErrorState::default();
        for _ in 0..9 {
            assert!(matches!(state.record_error(), Recovery::Backoff(_)));
        }
        assert_eq!(state.record_error(), Recovery::Reconnect);
        assert_eq!(state.consecutive_errors(), 10);
        // Still past the threshold until something resets it.
        assert_eq!(state.record_error(), Recovery::Reconnect);
    }

    #[test]
    fn nine_errors_then_success_resets_without_reconnect() {
        let mut state = ErrorState::default();
        for _ in 0..9 {
            assert_ne!(state.record_error(), Recovery::Reconnect);
        }
        state.reset();
        assert_eq!(state.consecutive_errors(), 0);
        assert_eq!(state.retry_delay(), DEFAULT_INITIAL_DELAY);
        assert_eq!(
            state.record_error(),
            Recovery::Backoff(DEFAULT_INITIAL_DELAY)
        );
    }

    #[test]
    fn delay_stays_in_bounds() {
        let mut state = ErrorState::default();
        for _ in 0..100 {
            let delay = state.next_delay();
            assert!(delay >= DEFAULT_INITIAL_DELAY && delay <= DEFAULT_MAX_DELAY);
            assert!(state.retry_delay() <= DEFAULT_MAX_DELAY);
        }
    }
}
