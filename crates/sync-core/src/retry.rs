use std::time::Duration;

/// Capped exponential backoff shared by the sync loop and the reconnector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    /// `max_delay_ms` is raised to `base_delay_ms` when smaller.
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        let base_delay_ms = base_delay_ms.max(1);
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Delay used right after a success.
    pub fn floor(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// A server-provided hint wins when it is longer than the computed delay,
    /// but never exceeds the cap.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        Duration::from_millis(calculated.max(hinted).min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000)
    }
}
