//! Retry helpers with exponential backoff.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Backoff policy shared by every retrying operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt (milliseconds)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Factor applied to the delay after each failed attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of attempts (None = retry forever)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Returns the initial delay as a Duration
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Returns the delay cap as a Duration
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Validates the backoff policy
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("initial_delay_ms cannot exceed max_delay_ms".to_string());
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err("multiplier must be a finite value >= 1.0".to_string());
        }

        if self.max_attempts == Some(0) {
            return Err("max_attempts cannot be 0".to_string());
        }

        Ok(())
    }
}

fn default_initial_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Returned when every allowed attempt has been used up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    #[error("Gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Delay to wait after the given (zero-based) failed attempt.
pub fn calculate_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    // Exponents past 64 only ever hit the cap
    let exponent = attempt.min(64) as i32;
    let delay_ms = config.initial_delay_ms as f64 * config.multiplier.powi(exponent);
    let capped_ms = delay_ms.min(config.max_delay_ms as f64);
    Duration::from_millis(capped_ms as u64)
}

/// Calls `attempt_fn` until it yields a value, sleeping with backoff in between.
///
/// Gives up with [`RetryError::Exhausted`] once `max_attempts` calls have
/// returned `None`.
pub async fn retry_until_some<T, F, Fut>(config: &BackoffConfig, mut attempt_fn: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let mut attempt = 0u32;

    loop {
        if let Some(value) = attempt_fn().await {
            if attempt > 0 {
                debug!(attempts = attempt + 1, "Retry succeeded");
            }
            return Ok(value);
        }

        attempt += 1;

        if let Some(max) = config.max_attempts {
            if attempt >= max {
                warn!(attempts = attempt, "Max retry attempts reached");
                return Err(RetryError::Exhausted { attempts: attempt });
            }
        }

        let backoff = calculate_backoff(attempt - 1, config);
        debug!(
            attempt = attempt,
            backoff_ms = backoff.as_millis() as u64,
            "Attempt yielded nothing, retrying after backoff"
        );

        tokio::time::sleep(backoff).await;
    }
}

/// Calls `attempt_fn` until it succeeds, returning the last error once
/// `max_attempts` is reached.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &BackoffConfig, mut attempt_fn: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;

    loop {
        match attempt_fn().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(attempt = attempt, "Succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;

                if let Some(max) = config.max_attempts {
                    if attempt >= max {
                        warn!(attempt = attempt, error = %e, "Max retry attempts reached");
                        return Err(e);
                    }
                }

                let backoff = calculate_backoff(attempt - 1, config);
                warn!(
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying after backoff"
                );

                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let config = config();

        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(200));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(400));
        assert_eq!(calculate_backoff(3, &config), Duration::from_millis(800));
        assert_eq!(calculate_backoff(4, &config), Duration::from_millis(1000)); // capped
        assert_eq!(calculate_backoff(u32::MAX, &config), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_some_on_fourth_call() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = retry_until_some(&config(), || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { (call == 4).then_some(call) }
        })
        .await;

        assert_eq!(result, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // 100 + 200 + 400
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(710), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_some_gives_up() {
        let calls = AtomicU32::new(0);
        let config = BackoffConfig {
            max_attempts: Some(3),
            ..config()
        };

        let result: Result<(), _> = retry_until_some(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { None }
        })
        .await;

        assert_eq!(result, Err(RetryError::Exhausted { attempts: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_returns_last_error() {
        let calls = AtomicU32::new(0);
        let config = BackoffConfig {
            max_attempts: Some(2),
            ..config()
        };

        let result: Result<(), String> = retry_with_backoff(&config, || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("failure {}", call)) }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let bad = BackoffConfig {
            multiplier: 0.5,
            ..config()
        };
        assert!(bad.validate().is_err());

        let bad = BackoffConfig {
            initial_delay_ms: 5000,
            ..config()
        };
        assert!(bad.validate().is_err());

        let bad = BackoffConfig {
            max_attempts: Some(0),
            ..config()
        };
        assert!(bad.validate().is_err());
    }
}
