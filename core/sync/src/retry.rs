//! Exponential backoff for transient remote failures.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use snapsync_common::{Error, Result};

/// Backoff parameters for remote calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    /// Randomize each delay by +/- 25%.
    pub jitter: bool,
}

impl RetryConfig {
    /// Doubling backoff starting at one second, capped at a minute.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the given failed retry index (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(31)));
        let capped = base.min(self.max_delay);

        if self.jitter {
            capped.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Whether an error is worth retrying.
///
/// Network hiccups, throttling and local I/O blips are; authentication,
/// missing folders and malformed responses are not.
pub fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Network(_) | Error::Io(_))
}

/// Runs async operations under a `RetryConfig`.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out.
    ///
    /// `what` names the operation in log lines.
    pub async fn execute<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded after {} retries", what, attempt);
                    }
                    return Ok(value);
                }
                Err(err) if !is_transient(&err) => return Err(err),
                Err(err) if attempt >= self.config.max_retries => {
                    warn!("{} failed after {} attempts: {}", what, attempt + 1, err);
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.config.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        "{} attempt {} failed: {}. Retrying in {:?}",
                        what, attempt, err, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}
