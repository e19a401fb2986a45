//! Retry configuration.

use core_config::ConfigError;

/// Configuration for retry with exponential backoff and jitter.
///
/// Implements the AWS Full Jitter algorithm: on attempt `n` the sleep is
/// drawn uniformly from `[wait_min, min(wait_max, multiplier *
/// exp_base^(n-1))]`. See
/// <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,

    /// Minimum wait between attempts, in seconds.
    pub wait_min: f64,

    /// Maximum wait between attempts, in seconds.
    pub wait_max: f64,

    /// Multiplier applied to the exponential term.
    pub multiplier: f64,

    /// Exponential base.
    pub exp_base: f64,

    /// Failure classes that trigger a retry. `None` retries everything
    /// that is not denied.
    pub retry_on: Option<Vec<String>>,

    /// Failure classes that are never retried. Takes precedence over
    /// `retry_on`.
    pub never_retry_on: Option<Vec<String>>,

    /// Kept for config parity: the engine always hands the final failure
    /// back unchanged inside the exhaustion error.
    pub reraise: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait_min: 1.0,
            wait_max: 60.0,
            multiplier: 1.0,
            exp_base: 2.0,
            retry_on: None,
            never_retry_on: None,
            reraise: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set wait bounds in seconds.
    pub fn with_wait(mut self, min: f64, max: f64) -> Self {
        self.wait_min = min;
        self.wait_max = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_exp_base(mut self, exp_base: f64) -> Self {
        self.exp_base = exp_base;
        self
    }

    /// Only retry failures whose class is in `classes`.
    pub fn retry_on(mut self, classes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.retry_on = Some(classes.into_iter().map(Into::into).collect());
        self
    }

    /// Never retry failures whose class is in `classes`.
    pub fn never_retry_on(mut self, classes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.never_retry_on = Some(classes.into_iter().map(Into::into).collect());
        self
    }

    /// Validate field bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::invalid("max_attempts", "must be >= 1"));
        }
        if self.wait_min < 0.0 {
            return Err(ConfigError::invalid("wait_min", "must be >= 0"));
        }
        if self.wait_max < 0.0 {
            return Err(ConfigError::invalid("wait_max", "must be >= 0"));
        }
        if self.multiplier < 0.0 {
            return Err(ConfigError::invalid("multiplier", "must be >= 0"));
        }
        if self.exp_base < 1.0 {
            return Err(ConfigError::invalid("exp_base", "must be >= 1"));
        }
        Ok(())
    }

    /// Backoff ceiling for attempt `n` (1-based), in seconds:
    /// `min(wait_max, multiplier * exp_base^(n-1))`.
    pub fn backoff_ceiling(&self, attempt: u32) -> f64 {
        let exp = self.exp_base.powi(attempt.saturating_sub(1) as i32);
        (self.multiplier * exp).min(self.wait_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.wait_min, 1.0);
        assert_eq!(config.wait_max, 60.0);
        assert_eq!(config.exp_base, 2.0);
        assert!(config.retry_on.is_none());
        assert!(config.never_retry_on.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_wait(0.5, 10.0)
            .with_multiplier(2.0)
            .with_exp_base(3.0)
            .retry_on(["io", "timeout"])
            .never_retry_on(["integrity"]);

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.wait_min, 0.5);
        assert_eq!(config.wait_max, 10.0);
        assert_eq!(config.retry_on.as_deref(), Some(&["io".to_string(), "timeout".to_string()][..]));
        assert_eq!(config.never_retry_on.as_deref(), Some(&["integrity".to_string()][..]));
    }

    #[test]
    fn test_validate_bounds() {
        assert!(RetryConfig::new().with_max_attempts(0).validate().is_err());
        assert!(RetryConfig::new().with_wait(-1.0, 10.0).validate().is_err());
        assert!(RetryConfig::new().with_wait(0.0, -1.0).validate().is_err());
        assert!(RetryConfig::new().with_multiplier(-0.1).validate().is_err());
        assert!(RetryConfig::new().with_exp_base(0.5).validate().is_err());
    }

    #[test]
    fn test_backoff_ceiling() {
        let config = RetryConfig::new().with_wait(0.0, 8.0).with_multiplier(1.0).with_exp_base(2.0);

        assert_eq!(config.backoff_ceiling(1), 1.0);
        assert_eq!(config.backoff_ceiling(2), 2.0);
        assert_eq!(config.backoff_ceiling(3), 4.0);
        // Capped by wait_max from attempt 4 on.
        assert_eq!(config.backoff_ceiling(4), 8.0);
        assert_eq!(config.backoff_ceiling(10), 8.0);
    }
}
