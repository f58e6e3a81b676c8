//! Error taxonomy for the real-time connection layer.

use std::time::Duration;

use thiserror::Error;

/// The main result type used throughout the connection layer.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Error returned by user-registered message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for all connection-layer operations.
///
/// Errors are `Clone` so one in-flight attempt can be shared by every caller
/// awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// The transport could not be reached.
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// The transport rejected the credential.
    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    /// The handshake did not complete in time.
    #[error("Connection timed out after {duration:?}")]
    ConnectionTimeout { duration: Duration },

    /// An outbound message could not be handed to the transport.
    #[error("Send failed: {message}")]
    SendFailed { message: String },

    /// The transport refused a wire-level subscription.
    #[error("Subscription to '{topic}' failed: {message}")]
    SubscriptionFailed { topic: String, message: String },

    /// No acknowledgment arrived before the deadline.
    #[error("Acknowledgment {correlation_id} timed out after {duration:?}")]
    AckTimeout {
        correlation_id: String,
        duration: Duration,
    },

    /// The operation was abandoned, usually by `disconnect()`.
    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    /// The operation needs a live connection.
    #[error("Not connected")]
    NotConnected,

    /// Real-time features are switched off by configuration.
    #[error("Real-time connection is disabled")]
    Disabled,

    /// Configuration errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal errors (should not happen in normal operation).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification of a [`RealtimeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    AuthFailed,
    ConnectionTimeout,
    SendFailed,
    SubscriptionFailed,
    AckTimeout,
    Cancelled,
    NotConnected,
    Disabled,
    Config,
    Internal,
}

impl RealtimeError {
    /// Create a connection failure.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Create an authentication failure.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    /// Create a handshake timeout.
    pub fn connection_timeout(duration: Duration) -> Self {
        Self::ConnectionTimeout { duration }
    }

    /// Create a send failure.
    pub fn send_failed(message: impl Into<String>) -> Self {
        Self::SendFailed {
            message: message.into(),
        }
    }

    /// Create a subscription failure.
    pub fn subscription_failed(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SubscriptionFailed {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create an acknowledgment timeout.
    pub fn ack_timeout(correlation_id: impl Into<String>, duration: Duration) -> Self {
        Self::AckTimeout {
            correlation_id: correlation_id.into(),
            duration,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::AuthFailed { .. } => ErrorKind::AuthFailed,
            Self::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            Self::SendFailed { .. } => ErrorKind::SendFailed,
            Self::SubscriptionFailed { .. } => ErrorKind::SubscriptionFailed,
            Self::AckTimeout { .. } => ErrorKind::AckTimeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::Disabled => ErrorKind::Disabled,
            Self::Config { .. } => ErrorKind::Config,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether retrying the operation later may succeed.
    ///
    /// Nothing in the taxonomy is fatal; only misconfiguration is not worth
    /// retrying.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Disabled | ErrorKind::Config)
    }

    /// Normalise an error raised by a provider handshake into one of the
    /// three connect categories.
    pub(crate) fn into_connect_failure(self) -> Self {
        match self {
            Self::ConnectionFailed { .. }
            | Self::AuthFailed { .. }
            | Self::ConnectionTimeout { .. } => self,
            other => Self::connection_failed(other.to_string()),
        }
    }
}
