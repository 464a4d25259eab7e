//! Exponential backoff for reconnects and resends

use std::time::Duration;

/// Delay that grows by `multiplier` after every failure, up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    current: Duration,
}

impl Backoff {
    /// Backoff starting at `initial`
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    /// Delays for resending replies: 200 ms doubling to 10 s
    #[must_use]
    pub const fn send() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(10), 2)
    }

    /// Delays between reconnects: 200 ms doubling to 5 s
    #[must_use]
    pub const fn reconnect() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5), 2)
    }

    /// The delay [`Backoff::next_delay`] will return
    #[must_use]
    pub const fn peek(&self) -> Duration {
        self.current
    }

    /// Current delay; the following one is longer
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(self.multiplier).min(self.max);
        delay
    }

    /// Back to the initial delay
    pub const fn reset(&mut self) {
        self.current = self.initial;
    }
}
