//! Connection-layer configuration.
//!
//! Settings come from the builder methods on [`RealtimeConfig`] or from the
//! environment through [`RealtimeConfig::from_env`]:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `ENABLE_REALTIME` | `enabled` | `true` |
//! | `DEBUG_MODE` | `debug_mode` | `false` |
//! | `RECONNECT_BASE_DELAY_MS` | `reconnect_base_delay` | 1s |
//! | `RECONNECT_MAX_DELAY_MS` | `reconnect_max_delay` | 30s |
//! | `FALLBACK_FAILURE_THRESHOLD` | `fallback_failure_threshold` | 5 |
//! | `ACK_DEFAULT_TIMEOUT_MS` | `ack_default_timeout` | 5s |

use std::time::Duration;

use crate::{
    error::{RealtimeError, RealtimeResult},
    reconnect::BackoffConfig,
};

/// What the dispatcher does with a message that resolves a pending
/// acknowledgment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckDelivery {
    /// Resolve the waiting sender only.
    #[default]
    ResolveOnly,
    /// Resolve the waiting sender and also deliver to matching handlers.
    ResolveAndDeliver,
}

/// Configuration for the real-time client.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    // Feature switches
    /// Master switch; when false `connect()` fails with `Disabled`.
    pub enabled: bool,
    /// Log every inbound and outbound message at debug level.
    pub debug_mode: bool,

    // Reconnection settings
    /// Delay before the first retry.
    pub reconnect_base_delay: Duration,
    /// Upper bound on the retry delay.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for retry delays.
    pub reconnect_backoff_factor: f64,
    /// Random jitter factor (0.0-1.0) for retry delays.
    pub reconnect_jitter: f64,
    /// Schedule retries automatically after a failed handshake.
    pub auto_retry: bool,
    /// Pause between the disconnect and connect halves of `reconnect()`.
    pub reconnect_settle_delay: Duration,
    /// Timeout for a provider handshake.
    pub connect_timeout: Duration,

    // Fallback settings
    /// Consecutive failures inside `fallback_window` that switch to polling.
    pub fallback_failure_threshold: u32,
    /// Sliding window used to count consecutive failures.
    pub fallback_window: Duration,
    /// Interval between polls while in fallback mode.
    pub poll_interval: Duration,
    /// Interval between background reconnect attempts while polling.
    pub polling_recovery_interval: Duration,
    /// Emit a notification when entering fallback mode.
    pub notify_on_fallback: bool,

    // Acknowledgments
    /// Default acknowledgment timeout for `send`.
    pub ack_default_timeout: Duration,
    /// Maximum number of outstanding acknowledgments.
    pub max_pending_acks: usize,
    /// Delivery policy for acknowledgment messages.
    pub ack_delivery: AckDelivery,

    // Credentials
    /// Delay before reconnecting after a failed token refresh.
    pub token_refresh_retry_delay: Duration,

    // Store mirroring
    /// Capacity of the bounded notification queue.
    pub notification_queue_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug_mode: false,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_backoff_factor: 2.0,
            reconnect_jitter: 0.2,
            auto_retry: true,
            reconnect_settle_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            fallback_failure_threshold: 5,
            fallback_window: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            polling_recovery_interval: Duration::from_secs(15),
            notify_on_fallback: false,
            ack_default_timeout: Duration::from_secs(5),
            max_pending_acks: 1000,
            ack_delivery: AckDelivery::ResolveOnly,
            token_refresh_retry_delay: Duration::from_secs(1),
            notification_queue_capacity: 100,
        }
    }
}

impl RealtimeConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from process environment variables.
    pub fn from_env() -> RealtimeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults; malformed values are rejected.
    pub fn from_lookup<F>(lookup: F) -> RealtimeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("ENABLE_REALTIME") {
            config.enabled = parse_bool("ENABLE_REALTIME", &raw)?;
        }
        if let Some(raw) = lookup("DEBUG_MODE") {
            config.debug_mode = parse_bool("DEBUG_MODE", &raw)?;
        }
        if let Some(raw) = lookup("RECONNECT_BASE_DELAY_MS") {
            config.reconnect_base_delay = parse_millis("RECONNECT_BASE_DELAY_MS", &raw)?;
        }
        if let Some(raw) = lookup("RECONNECT_MAX_DELAY_MS") {
            config.reconnect_max_delay = parse_millis("RECONNECT_MAX_DELAY_MS", &raw)?;
        }
        if let Some(raw) = lookup("FALLBACK_FAILURE_THRESHOLD") {
            config.fallback_failure_threshold = raw.trim().parse().map_err(|_| {
                RealtimeError::config(format!("FALLBACK_FAILURE_THRESHOLD: invalid number '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup("ACK_DEFAULT_TIMEOUT_MS") {
            config.ack_default_timeout = parse_millis("ACK_DEFAULT_TIMEOUT_MS", &raw)?;
        }

        config.validate().map_err(RealtimeError::config)?;
        Ok(config)
    }

    /// Enable or disable the real-time connection.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Enable or disable per-message debug logging.
    #[must_use]
    pub fn debug_mode(mut self, debug: bool) -> Self {
        self.debug_mode = debug;
        self
    }

    /// Set the base retry delay.
    #[must_use]
    pub fn reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    /// Set the maximum retry delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Set the jitter factor.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Enable or disable automatic retries.
    #[must_use]
    pub fn auto_retry(mut self, auto_retry: bool) -> Self {
        self.auto_retry = auto_retry;
        self
    }

    /// Set the settle delay used by `reconnect()`.
    #[must_use]
    pub fn reconnect_settle_delay(mut self, delay: Duration) -> Self {
        self.reconnect_settle_delay = delay;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the number of consecutive failures that triggers polling.
    #[must_use]
    pub fn fallback_failure_threshold(mut self, threshold: u32) -> Self {
        self.fallback_failure_threshold = threshold;
        self
    }

    /// Set the sliding window for counting failures.
    #[must_use]
    pub fn fallback_window(mut self, window: Duration) -> Self {
        self.fallback_window = window;
        self
    }

    /// Set the polling interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the background reconnect interval while polling.
    #[must_use]
    pub fn polling_recovery_interval(mut self, interval: Duration) -> Self {
        self.polling_recovery_interval = interval;
        self
    }

    /// Emit a notification when fallback mode starts.
    #[must_use]
    pub fn notify_on_fallback(mut self, notify: bool) -> Self {
        self.notify_on_fallback = notify;
        self
    }

    /// Set the default acknowledgment timeout.
    #[must_use]
    pub fn ack_default_timeout(mut self, timeout: Duration) -> Self {
        self.ack_default_timeout = timeout;
        self
    }

    /// Set the maximum number of outstanding acknowledgments.
    #[must_use]
    pub fn max_pending_acks(mut self, max: usize) -> Self {
        self.max_pending_acks = max;
        self
    }

    /// Set the acknowledgment delivery policy.
    #[must_use]
    pub fn ack_delivery(mut self, delivery: AckDelivery) -> Self {
        self.ack_delivery = delivery;
        self
    }

    /// Set the delay before reconnecting after a failed token refresh.
    #[must_use]
    pub fn token_refresh_retry_delay(mut self, delay: Duration) -> Self {
        self.token_refresh_retry_delay = delay;
        self
    }

    /// Set the notification queue capacity.
    #[must_use]
    pub fn notification_queue_capacity(mut self, capacity: usize) -> Self {
        self.notification_queue_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        BackoffConfig::from_config(self).validate()?;
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.fallback_failure_threshold == 0 {
            return Err("Fallback failure threshold must be > 0".to_string());
        }
        if self.fallback_window.is_zero() {
            return Err("Fallback window must be > 0".to_string());
        }
        if self.poll_interval.is_zero() {
            return Err("Poll interval must be > 0".to_string());
        }
        if self.polling_recovery_interval.is_zero() {
            return Err("Polling recovery interval must be > 0".to_string());
        }
        if self.ack_default_timeout.is_zero() {
            return Err("Ack timeout must be > 0".to_string());
        }
        if self.max_pending_acks == 0 {
            return Err("Max pending acks must be > 0".to_string());
        }
        if self.notification_queue_capacity == 0 {
            return Err("Notification queue capacity must be > 0".to_string());
        }
        Ok(())
    }
}

fn parse_bool(key: &str, raw: &str) -> RealtimeResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RealtimeError::config(format!(
            "{key}: invalid boolean '{raw}'"
        ))),
    }
}

fn parse_millis(key: &str, raw: &str) -> RealtimeResult<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| RealtimeError::config(format!("{key}: invalid milliseconds '{raw}'")))
}
