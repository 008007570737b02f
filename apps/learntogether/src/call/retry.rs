use std::time::Duration;

/// Backoff schedule for reaching the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting between failures.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based). The first attempt
    /// runs immediately; later ones double the delay up to `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 2).min(31);
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }

    pub fn attempts(&self) -> impl Iterator<Item = (u32, Duration)> + '_ {
        (1..=self.max_attempts.max(1)).map(|attempt| (attempt, self.delay_before(attempt)))
    }
}
