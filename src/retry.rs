//! Exponential backoff used around checkpoint-store and stream calls

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{trace, warn};

/// Exponential backoff with proportional jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (zero-based); never exceeds `max_delay`
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        let base_ms = (self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32))
        .min(max_ms);

        let spread = base_ms * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        let delay_ms = (base_ms + jitter).clamp(0.0, max_ms);

        trace!(attempt, base_ms, delay_ms, "Computed backoff delay");
        Duration::from_millis(delay_ms as u64)
    }
}

/// Run `op` until it succeeds or `max_retries` retries have failed.
///
/// Returns the last error once retries are exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation: &str,
    max_retries: u32,
    backoff: &ExponentialBackoff,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_retries => return Err(e),
            Err(e) => {
                let delay = backoff.delay(attempt);
                warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
