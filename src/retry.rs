use std::time::Duration;

/// Bounded retry: at most `max_attempts` calls, sleeping `interval` between
/// consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Calls `op` with the 1-based attempt number until it returns `Ok`.
    /// Returns the last error once the attempts are used up.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> std::result::Result<T, E>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    log::warn!("{} failed after {} attempts: {}", what, attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    log::debug!("{} attempt {}/{} failed: {}", what, attempt, attempts, e);
                    if !self.interval.is_zero() {
                        std::thread::sleep(self.interval);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Polling form of [`RetryPolicy::run`] for checks that yield nothing
    /// until a resource becomes ready.
    pub fn poll<T, F>(&self, what: &str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Option<T>,
    {
        self.run(what, |_| op().ok_or("not ready")).ok()
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn worst_case_wait(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}
