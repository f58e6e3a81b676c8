//! Credential refresh coordinator.
//!
//! Owns the current [`CredentialLease`], coalesces concurrent refreshes into
//! one request, and reacts to the credential source's expiry signal by
//! re-authenticating the live connection in place.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::Inner,
    credentials::{CredentialLease, CredentialSource},
    error::{RealtimeError, RealtimeResult},
    flight::SingleFlight,
    state::ConnectionState,
};

/// Disconnect reason used when a refresh leaves no usable credential.
pub const TOKEN_REFRESH_FAILED: &str = "token_refresh_failed";

type LeaseSlot = Arc<RwLock<Option<Arc<CredentialLease>>>>;

pub(crate) struct RefreshCoordinator {
    source: Option<Arc<dyn CredentialSource>>,
    lease: LeaseSlot,
    flight: SingleFlight<Arc<CredentialLease>>,
}

impl RefreshCoordinator {
    pub(crate) fn new(source: Option<Arc<dyn CredentialSource>>) -> Self {
        Self {
            source,
            lease: Arc::new(RwLock::new(None)),
            flight: SingleFlight::new(),
        }
    }

    /// Token for the next handshake: the explicit one, else the current
    /// unexpired lease, else whatever the source has cached.
    pub(crate) fn resolve_token(&self, explicit: Option<&str>) -> Option<String> {
        if let Some(token) = explicit {
            return Some(token.to_string());
        }
        if let Some(lease) = self.lease.read().as_ref()
            && !lease.is_expired()
        {
            return Some(lease.token().to_string());
        }
        self.source.as_ref().and_then(|source| source.current_token())
    }

    pub(crate) fn lease(&self) -> Option<Arc<CredentialLease>> {
        self.lease.read().clone()
    }

    pub(crate) fn expiry_signal(&self) -> Option<broadcast::Receiver<()>> {
        self.source.as_ref().and_then(|source| source.expiry_signal())
    }

    #[cfg(test)]
    pub(crate) fn is_refreshing(&self) -> bool {
        self.flight.is_in_flight()
    }

    /// Obtain a new lease. Concurrent callers share one request.
    pub(crate) async fn refresh(&self) -> RealtimeResult<Arc<CredentialLease>> {
        let Some(source) = self.source.clone() else {
            return Err(RealtimeError::auth("no credential source configured"));
        };
        let slot = self.lease.clone();

        self.flight
            .join_or_start(move || async move {
                let lease = Arc::new(source.refresh().await?);
                *slot.write() = Some(lease.clone());
                info!(expiry = ?lease.expiry_hint(), "Credential lease refreshed");
                Ok(lease)
            })
            .await
    }
}

/// Listen for expiry signals until shutdown.
pub(crate) fn spawn_expiry_watcher(
    inner: &Arc<Inner>,
    mut signal: broadcast::Receiver<()>,
    shutdown: CancellationToken,
) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = signal.recv() => received,
            };
            match received {
                Ok(()) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Coalescing missed expiry signals");
                }
                Err(RecvError::Closed) => break,
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            handle_expiry(&inner).await;
        }
        debug!("Expiry watcher stopped");
    });
}

/// Refresh the lease and swap it into the live connection.
pub(crate) async fn handle_expiry(inner: &Arc<Inner>) {
    info!("Credential expiry signalled");

    let lease = match inner.credentials.refresh().await {
        Ok(lease) => lease,
        Err(error) => {
            warn!(error = %error, "Credential refresh failed");
            inner.record_error(&error);
            recover_after_refresh_failure(inner).await;
            return;
        }
    };

    if !inner.machine.current().is_connected() {
        debug!("Not connected; next handshake uses the refreshed lease");
        return;
    }

    if !inner.transport.supports_reauthentication() {
        debug!(
            transport = inner.transport.name(),
            "Transport cannot re-authenticate in place; reconnecting"
        );
        if let Err(error) = inner.reconnect().await {
            warn!(error = %error, "Reconnect after credential refresh failed");
        }
        return;
    }

    match inner.transport.reauthenticate(lease.token()).await {
        Ok(()) => info!("Live connection re-authenticated"),
        Err(error) => {
            warn!(error = %error, "In-place re-authentication failed");
            inner.record_error(&error);
            recover_after_refresh_failure(inner).await;
        }
    }
}

/// Force a disconnect, then try again after the configured delay.
async fn recover_after_refresh_failure(inner: &Arc<Inner>) {
    inner.disconnect(TOKEN_REFRESH_FAILED, false).await;

    let delay = inner.config.token_refresh_retry_delay;
    let cancel = inner.retry_token();
    let weak = Arc::downgrade(inner);

    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.machine.current() != ConnectionState::Disconnected {
            return;
        }
        if let Err(error) = inner.connect(None).await {
            debug!(error = %error, "Connect after refresh failure failed");
        }
    });
}

/// Refresh the credential, then reconnect with it.
///
/// Concurrent calls share one run.
pub(crate) async fn refresh_token_and_reconnect(inner: &Arc<Inner>) -> RealtimeResult<()> {
    let runner = inner.clone();
    inner
        .refresh_and_reconnect
        .join_or_start(move || async move {
            match runner.credentials.refresh().await {
                Ok(_) => runner.reconnect().await,
                Err(error) => {
                    runner.record_error(&error);
                    runner.disconnect(TOKEN_REFRESH_FAILED, false).await;
                    Err(error)
                }
            }
        })
        .await
}
