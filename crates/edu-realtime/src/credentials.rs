//! Credential source contract and the lease it hands out.

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::{RealtimeError, RealtimeResult};

/// A bearer token plus its expiry metadata.
///
/// Leases are immutable; a refresh produces a new one.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialLease {
    token: String,
    expiry_hint: Option<SystemTime>,
}

impl CredentialLease {
    pub fn new(token: impl Into<String>, expiry_hint: Option<SystemTime>) -> Self {
        Self {
            token: token.into(),
            expiry_hint,
        }
    }

    /// Lease that expires `ttl` from now.
    pub fn expiring_in(token: impl Into<String>, ttl: Duration) -> Self {
        Self::new(token, SystemTime::now().checked_add(ttl))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expiry_hint(&self) -> Option<SystemTime> {
        self.expiry_hint
    }

    /// True once the hinted expiry has passed. Leases without a hint never
    /// expire on their own.
    pub fn is_expired(&self) -> bool {
        self.expiry_hint
            .is_some_and(|expiry| expiry <= SystemTime::now())
    }
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("token", &"<redacted>")
            .field("expiry_hint", &self.expiry_hint)
            .finish()
    }
}

/// Supplier of bearer credentials, typically backed by the identity provider.
///
/// # Example
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use edu_realtime::{CredentialLease, CredentialSource, RealtimeResult};
///
/// struct SessionTokens;
///
/// #[async_trait]
/// impl CredentialSource for SessionTokens {
///     fn current_token(&self) -> Option<String> {
///         Some("cached-token".into())
///     }
///
///     async fn refresh(&self) -> RealtimeResult<CredentialLease> {
///         Ok(CredentialLease::new("fresh-token", None))
///     }
/// }
/// ```
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    /// The token to use right now, if any.
    fn current_token(&self) -> Option<String>;

    /// Obtain a new lease.
    async fn refresh(&self) -> RealtimeResult<CredentialLease>;

    /// Signal fired when the current credential is about to expire.
    fn expiry_signal(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

/// Credential source backed by a settable token.
///
/// Used by the demo program and handy for services that receive tokens from
/// somewhere else. `refresh` returns whatever token is currently set.
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
    ttl: Option<Duration>,
    expiry_tx: broadcast::Sender<()>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        let (expiry_tx, _) = broadcast::channel(4);
        Self {
            token: RwLock::new(token),
            ttl: None,
            expiry_tx,
        }
    }

    /// Stamp refreshed leases with an expiry `ttl` in the future.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Replace the token, e.g. after a login or logout.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Fire the expiry signal. Returns the number of listeners reached.
    pub fn expire(&self) -> usize {
        self.expiry_tx.send(()).unwrap_or(0)
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    fn current_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    async fn refresh(&self) -> RealtimeResult<CredentialLease> {
        let token = self
            .token
            .read()
            .clone()
            .ok_or_else(|| RealtimeError::auth("no credential available"))?;
        Ok(match self.ttl {
            Some(ttl) => CredentialLease::expiring_in(token, ttl),
            None => CredentialLease::new(token, None),
        })
    }

    fn expiry_signal(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.expiry_tx.subscribe())
    }
}
