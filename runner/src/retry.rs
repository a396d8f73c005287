//! Retry with exponential backoff and jitter for calls to the queue service.

use crate::config::RetrySettings;
use rand::Rng;
use std::{thread, time::Duration};
use tracing::{error, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            ..Default::default()
        }
    }
}

impl RetryConfig {
    /// A single attempt, errors are returned immediately
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Spread concurrent retries apart, the delay is scaled by a random factor in `[0.5, 1.5)`
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// Run `operation` until it succeeds, `max_attempts` is exhausted or `retryable` rejects an error
pub fn retry_with_backoff<T, E, F, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut backoff = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);

        let error = match operation() {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        if !retryable(&error) {
            return Err(error);
        }

        if config.max_attempts != 0 && attempt >= config.max_attempts {
            error!(operation = %operation_name, attempts = attempt, error = %error, "Giving up");
            return Err(error);
        }

        let pause = jittered(backoff);
        warn!(
            operation = %operation_name,
            attempt,
            error = %error,
            pause_ms = pause.as_millis(),
            "Attempt failed"
        );
        thread::sleep(pause);

        backoff = backoff.mul_f64(config.backoff_multiplier).min(config.max_delay);
    }
}
