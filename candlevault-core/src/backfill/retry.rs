//! Window-level retry with exponential backoff and jitter.

use crate::venue::FetchError;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Longest single sleep before the cancellation flag is re-checked.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

/// How a retried operation ended.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Failed { error: FetchError, attempts: u32 },
    Cancelled { attempts: u32 },
}

impl RetryPolicy {
    /// Retries with no waiting, for tests and offline venues.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    fn delay_for(&self, attempt: u32, error: &FetchError) -> Duration {
        let mut delay = self.backoff(attempt);
        if !self.jitter.is_zero() {
            let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
            delay += Duration::from_millis(jitter_ms);
        }
        match error.retry_after() {
            Some(floor) => delay.max(floor),
            None => delay,
        }
    }

    /// Run `op` until it succeeds, fails permanently, runs out of retries or
    /// `cancel` is raised. `op` receives the 1-based attempt number.
    pub fn run<T>(
        &self,
        cancel: &AtomicBool,
        mut op: impl FnMut(u32) -> Result<T, FetchError>,
    ) -> RetryOutcome<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => {
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    }
                }
                Err(error) if !error.is_retryable() || attempt > self.max_retries => {
                    return RetryOutcome::Failed {
                        error,
                        attempts: attempt,
                    }
                }
                Err(error) => {
                    let delay = self.delay_for(attempt, &error);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, %error, "transient fetch failure, retrying");
                    if !sleep_unless_cancelled(delay, cancel) {
                        return RetryOutcome::Cancelled { attempts: attempt };
                    }
                }
            }
        }
    }
}

/// Sleep for `total`, waking early if `cancel` is raised. Returns false if
/// cancelled.
fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
