//! Retry plumbing: jittered exponential backoff with a per-loop budget.

use crate::config::SinkConfig;
use rand::Rng;
use silt_core::{Result, SiltError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff with full jitter.
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn from_config(cfg: &SinkConfig) -> Self {
        Self::new(cfg.backoff_base(), cfg.backoff_cap())
    }

    /// The next backoff duration, jittered over `[0, base * 2^attempt]`.
    pub fn next_backoff(&mut self) -> Duration {
        let ceiling = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt += 1;
        let jittered = rand::thread_rng().gen_range(0..=ceiling.as_millis().max(1) as u64);
        Duration::from_millis(jittered)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Run `op` until it succeeds, the error is not retriable, the retry budget
/// is exhausted, or `cancel` fires.
///
/// Each attempt is bounded by `deadline`; a deadline expiry counts as a
/// retriable timeout.
pub async fn with_retries<T, F, Fut>(
    what: &'static str,
    cfg: &SinkConfig,
    deadline: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = ExponentialBackoff::from_config(cfg);

    loop {
        if cancel.is_cancelled() {
            return Err(SiltError::transient(format!("{what}: canceled")));
        }

        let attempt = async {
            match tokio::time::timeout(deadline, op()).await {
                Ok(result) => result,
                Err(_) => Err(SiltError::timeout(format!("{what} after {deadline:?}"))),
            }
        };

        let err = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(SiltError::transient(format!("{what}: canceled")));
            }
            result = attempt => match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            },
        };

        if !err.is_retriable() || backoff.attempt() >= cfg.retry_budget {
            if err.is_retriable() {
                warn!(what, attempts = backoff.attempt(), error = %err, "retry budget exhausted");
            }
            return Err(err);
        }

        let delay = backoff.next_backoff();
        metrics::counter!("silt_retries_total", "op" => what).increment(1);
        debug!(what, attempt = backoff.attempt(), ?delay, error = %err, "retrying");
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(SiltError::transient(format!("{what}: canceled")));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
