//! Retry policy for meter exchanges.
//!
//! Meters sit behind slow, lossy links. Some failures are worth a second
//! attempt (a dropped association is re-established by the next exchange),
//! others are not (a rejected association will be rejected again).
//!
//! # Example
//!
//! ```
//! use meterlink_core::{Error, RetryConfig, with_retry_if};
//!
//! # async fn example() -> Result<(), Error> {
//! let config = RetryConfig::new(3);
//!
//! let value = with_retry_if(
//!     &config,
//!     "read_clock",
//!     |e: &Error| matches!(e, Error::AssociationLost { .. }),
//!     || async { Ok::<_, Error>(42) },
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};


/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 means no retries).
    pub max_retries: u32,
    /// Initial delay between retries.
    #[serde(with = "crate::correlation::duration_millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(with = "crate::correlation::duration_millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Backoff multiplier (1.0 = constant delay, 2.0 = double each time).
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// No retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// One retry after a lost association.
    ///
    /// The retry re-associates from scratch, so a short pause is enough.
    pub fn for_association_loss() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    // ==================== Builder Methods ====================

    /// Set maximum number of retries.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before retry number `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64()).max(0.0);

        let final_delay = if self.jitter {
            // Up to 25% extra
            let jitter_factor = 1.0 + (rand::rng().random::<f64>() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Execute an async operation, retrying errors accepted by `should_retry`.
///
/// Returns the first success, the first error `should_retry` rejects, or the
/// last error once the retries are used up.
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    operation: F,
) -> std::result::Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_retries || !should_retry(&e) {
                    return Err(e);
                }
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::Error;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert!(config.jitter);
        assert_eq!(RetryConfig::none().max_retries, 0);
        assert_eq!(RetryConfig::for_association_loss().max_retries, 1);
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(300),
            jitter: false,
            max_retries: 5,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig::new(1)
            .initial_delay(Duration::from_millis(400))
            .jitter(true);
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_config_serde_uses_milliseconds() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_retries": 1, "initial_delay_ms": 20}"#).unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.initial_delay, Duration::from_millis(20));
        assert_eq!(config.max_delay, RetryConfig::default().max_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_if_respects_predicate() {
        let config = RetryConfig::new(3).jitter(false);
        let attempts = AtomicU32::new(0);

        let result: std::result::Result<(), Error> = with_retry_if(
            &config,
            "test",
            |e: &Error| matches!(e, Error::AssociationLost { .. }),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::timeout("read", Duration::from_secs(1)))
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
