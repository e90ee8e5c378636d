use std::{
    fmt::Display,
    sync::{Mutex, TryLockError},
};

use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

use crate::models::retry::RetryConfig;

const JITTER: f64 = 0.1;

/// Short in-process retry for a single call. Failures that survive it are
/// left to the broker's dead-letter loop.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, max_attempts, "Call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt >= max_attempts {
            warn!(max_attempts, error = %error, "Giving up on call");
            return Err(error);
        }

        let delay = with_jitter(config.backoff(attempt));
        debug!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Call failed, backing off"
        );

        sleep(delay).await;
        attempt += 1;
    }
}

/// Spreads `delay` by up to ten percent either way, in whole milliseconds.
fn with_jitter(delay: Duration) -> Duration {
    let factor = 1.0 + rand::random_range(-JITTER..=JITTER);
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

/// Decides when a lazily cleaned map is due for a full scan: only once it has
/// grown past `threshold`, and then at most once per `interval`. A caller that
/// finds another sweep in progress skips instead of waiting.
#[derive(Debug)]
pub struct SweepGate {
    threshold: usize,
    interval: Duration,
    last_sweep: Mutex<Option<Instant>>,
}

impl SweepGate {
    pub fn new(threshold: usize, interval: Duration) -> Self {
        Self {
            threshold,
            interval,
            last_sweep: Mutex::new(None),
        }
    }

    /// Claims the next sweep when `len` is over the threshold and the
    /// previous sweep is at least one interval old.
    pub fn try_claim(&self, len: usize, now: Instant) -> bool {
        if len <= self.threshold {
            return false;
        }

        let mut last_sweep = match self.last_sweep.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };

        let due = last_sweep.is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            *last_sweep = Some(now);
        }

        due
    }
}
