use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

impl RetryConfig {
    /// Same delay between every attempt, no jitter.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        let interval_ms = interval.as_millis() as u64;

        Self {
            max_attempts,
            initial_delay_ms: interval_ms,
            max_delay_ms: interval_ms,
            backoff_multiplier: 1,
        }
    }

    pub fn is_fixed_interval(&self) -> bool {
        self.backoff_multiplier <= 1
    }
}
