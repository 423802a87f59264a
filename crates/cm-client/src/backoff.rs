use std::time::Duration;

/// Exponential reconnect backoff.
///
/// Starts at the initial delay and doubles after every consumed delay.
/// [`reset`](Self::reset) returns it to the initial delay; the session
/// manager calls it on every successful TCP connect, so one good connect is
/// enough to clear accumulated backoff. The protocol fixes the cadence, so
/// there is no jitter and no cap; doubling saturates at the `Duration`
/// limit.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `initial`.
    #[must_use]
    pub const fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
        }
    }

    /// Returns the next delay and advances the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2);
        delay
    }

    /// Resets the backoff to its initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_the_initial_value() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
    }

    #[test]
    fn reset_returns_to_the_initial_delay() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn doubling_saturates_without_panicking() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1));
        let mut last = Duration::ZERO;
        for _ in 0..200 {
            let delay = backoff.next_delay();
            assert!(delay >= last);
            last = delay;
        }
    }
}
