use std::time::Duration;

use rand::Rng;

use crate::config::RealtimeConfig;

/// Reconnect/backoff configuration shared by the retry scheduler and the
/// polling recovery loop.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BackoffConfig {
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) factor: f64,
    pub(crate) jitter: f64,
}

impl BackoffConfig {
    pub(crate) fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            initial_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            factor: config.reconnect_backoff_factor,
            jitter: config.reconnect_jitter,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay.is_zero() {
            return Err("Max reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

pub(crate) fn calculate_backoff(config: BackoffConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay.as_secs_f64();
    let max = config.max_delay.as_secs_f64();
    let exponent = config.factor.powf(f64::from(attempt));
    let base = (initial * exponent).min(max);

    if config.jitter == 0.0 {
        return Duration::from_secs_f64(base);
    }

    let mut rng = rand::rng();
    let randomized = rng.random_range(0.0..=base);
    let blended = base * (1.0 - config.jitter) + randomized * config.jitter;
    Duration::from_secs_f64(blended)
}

/// Attempt counter feeding [`calculate_backoff`].
///
/// Reset to the base delay on every successful CONNECTED transition.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for the next retry; advances the attempt counter.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = calculate_backoff(self.config, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    #[cfg(test)]
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_calculate_backoff_without_jitter_is_deterministic() {
        let config = no_jitter();
        assert_eq!(calculate_backoff(config, 0), Duration::from_secs(1));
        assert_eq!(calculate_backoff(config, 1), Duration::from_secs(2));
        assert_eq!(calculate_backoff(config, 4), Duration::from_secs(16));
        assert_eq!(calculate_backoff(config, 5), Duration::from_secs(30));
        assert_eq!(calculate_backoff(config, 12), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let config = BackoffConfig {
            jitter: 1.0,
            ..no_jitter()
        };
        for attempt in 0..10 {
            assert!(calculate_backoff(config, attempt) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_backoff_resets_to_base() {
        let mut backoff = Backoff::new(no_jitter());
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let config = BackoffConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..no_jitter()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            "Max reconnect delay must be >= initial reconnect delay"
        );
    }
}
