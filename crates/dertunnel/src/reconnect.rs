use std::time::Duration;

const INITIAL_DELAY_MS: u64 = 300;
const BACKOFF: f64 = 1.4;
const MAX_DELAY_MS: u64 = 10_000;

/// Backoff between reconnect attempts: `min(10 s, 300 ms * 1.4^n)`
#[derive(Debug, Clone)]
pub struct ReconnectTimer {
    attempt: i32,
    saturated: bool,
}

impl Default for ReconnectTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            saturated: false,
        }
    }

    /// Delay the next reconnect would wait
    pub fn current(&self) -> Duration {
        let ms = (INITIAL_DELAY_MS as f64 * BACKOFF.powi(self.attempt)).round() as u64;
        Duration::from_millis(ms.min(MAX_DELAY_MS))
    }

    /// Take the current delay and back off for the following attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        if !self.saturated {
            self.attempt += 1;
            self.saturated = delay.as_millis() >= u128::from(MAX_DELAY_MS);
        }
        delay
    }

    /// Back to the initial delay after a successful HELLO
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.saturated = false;
    }
}
