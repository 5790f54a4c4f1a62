use std::time::Duration;

/// Reconnect delay for the notification channel: `base × factor`, where the
/// factor goes 0, 1, 2, 4, ... up to `max_factor` and resets on success.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max_factor: u32,
    factor: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max_factor: u32) -> Self {
        Self {
            base,
            max_factor: max_factor.max(1),
            factor: 0,
        }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Delay to wait before the next connection attempt.
    pub fn delay(&self) -> Duration {
        self.base * self.factor
    }

    pub fn on_failure(&mut self) {
        self.factor = if self.factor == 0 {
            1
        } else {
            self.factor.saturating_mul(2).min(self.max_factor)
        };
    }

    pub fn on_success(&mut self) {
        self.factor = 0;
    }
}
