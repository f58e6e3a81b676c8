//! Fallback controller: retry scheduling after failed handshakes and the
//! degraded polling mode entered once the failure budget is spent.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::Inner,
    config::RealtimeConfig,
    error::ErrorKind,
    reconnect::{Backoff, BackoffConfig},
    state::{ConnectionState, TransitionCause},
    transport::PollingSource,
};

/// Consecutive handshake failures inside a sliding time window.
#[derive(Debug)]
pub(crate) struct FailureWindow {
    failures: VecDeque<Instant>,
    threshold: u32,
    window: Duration,
}

impl FailureWindow {
    pub(crate) fn new(threshold: u32, window: Duration) -> Self {
        Self {
            failures: VecDeque::new(),
            threshold,
            window,
        }
    }

    /// Record a failure at `now`. Returns `true` once the threshold is
    /// reached inside the window.
    pub(crate) fn record(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        while let Some(oldest) = self.failures.front()
            && now.duration_since(*oldest) > self.window
        {
            self.failures.pop_front();
        }
        self.failures.len() >= self.threshold as usize
    }

    pub(crate) fn reset(&mut self) {
        self.failures.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.failures.len()
    }
}

pub(crate) struct FallbackController {
    failures: Mutex<FailureWindow>,
    backoff: Mutex<Backoff>,
    polling: Mutex<Option<CancellationToken>>,
    source: Option<Arc<dyn PollingSource>>,
    poll_interval: Duration,
    recovery_interval: Duration,
}

impl FallbackController {
    pub(crate) fn new(config: &RealtimeConfig, source: Option<Arc<dyn PollingSource>>) -> Self {
        Self {
            failures: Mutex::new(FailureWindow::new(
                config.fallback_failure_threshold,
                config.fallback_window,
            )),
            backoff: Mutex::new(Backoff::new(BackoffConfig::from_config(config))),
            polling: Mutex::new(None),
            source,
            poll_interval: config.poll_interval,
            recovery_interval: config.polling_recovery_interval,
        }
    }

    pub(crate) fn record_failure(&self) -> bool {
        self.failures.lock().record(Instant::now())
    }

    pub(crate) fn consecutive_failures(&self) -> usize {
        self.failures.lock().len()
    }

    pub(crate) fn next_retry_delay(&self) -> Duration {
        self.backoff.lock().next_delay()
    }

    /// Reset failure tracking and backoff, and stop polling.
    pub(crate) fn on_connected(&self) {
        self.failures.lock().reset();
        self.backoff.lock().reset();
        self.stop_polling();
    }

    fn begin_polling(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        if let Some(previous) = self.polling.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    pub(crate) fn stop_polling(&self) {
        if let Some(token) = self.polling.lock().take() {
            token.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_polling(&self) -> bool {
        self.polling.lock().is_some()
    }
}

/// Decide what follows a failed handshake: polling once the failure budget
/// is spent, otherwise a backoff retry.
pub(crate) fn after_failure(inner: &Arc<Inner>, kind: ErrorKind) {
    if inner.fallback.record_failure() {
        enter_polling(inner);
    } else if inner.config.auto_retry {
        schedule_retry(inner, Some(kind));
    }
}

/// Schedule a reconnect after the next backoff delay.
///
/// Moves ERROR to RECONNECTING first. An `AuthFailed` retry refreshes the
/// credential before connecting.
pub(crate) fn schedule_retry(inner: &Arc<Inner>, failure: Option<ErrorKind>) {
    let applied = inner.machine.transition_if(
        |state| state == ConnectionState::Error,
        ConnectionState::Reconnecting,
        TransitionCause::RetryScheduled,
    );
    if applied.is_none() && inner.machine.current() != ConnectionState::Reconnecting {
        return;
    }

    let delay = inner.fallback.next_retry_delay();
    let cancel = inner.retry_token();
    let weak = Arc::downgrade(inner);
    debug!(delay_ms = delay.as_millis() as u64, ?failure, "Scheduling reconnect");

    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };

        if failure == Some(ErrorKind::AuthFailed)
            && let Err(error) = inner.credentials.refresh().await
        {
            warn!(error = %error, "Credential refresh before retry failed");
            inner.record_error(&error);
        }

        if cancel.is_cancelled() || inner.machine.current() != ConnectionState::Reconnecting {
            return;
        }
        if let Err(error) = inner.connect(None).await {
            debug!(error = %error, "Reconnect attempt failed");
        }
    });
}

/// Switch to polling and start the poll and recovery loops.
fn enter_polling(inner: &Arc<Inner>) {
    let applied = inner.machine.transition_if(
        |state| state == ConnectionState::Error,
        ConnectionState::Polling,
        TransitionCause::FallbackEngaged,
    );
    if applied.is_none() {
        return;
    }

    warn!(
        failures = inner.fallback.consecutive_failures(),
        "Transport unavailable; switching to polling fallback"
    );

    let token = inner.fallback.begin_polling(&inner.shutdown);
    if let Some(source) = inner.fallback.source.clone() {
        tokio::spawn(poll_loop(
            Arc::downgrade(inner),
            source,
            inner.fallback.poll_interval,
            token.clone(),
        ));
    }
    tokio::spawn(recovery_loop(
        Arc::downgrade(inner),
        inner.fallback.recovery_interval,
        token,
    ));
}

async fn poll_loop(
    weak: Weak<Inner>,
    source: Arc<dyn PollingSource>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.machine.current() != ConnectionState::Polling {
            break;
        }

        let topics = inner.subscriptions.active_topics();
        match source.poll(&topics).await {
            Ok(messages) => {
                debug!(count = messages.len(), "Polled messages");
                for message in messages {
                    if cancel.is_cancelled() {
                        break;
                    }
                    inner.stats.record_received();
                    inner.handle_inbound(message);
                }
            }
            Err(error) => warn!(error = %error, "Poll failed"),
        }
    }
    debug!("Poll loop stopped");
}

async fn recovery_loop(weak: Weak<Inner>, period: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(period) => {}
        }
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.machine.current() != ConnectionState::Polling {
            break;
        }

        match inner.connect(None).await {
            Ok(()) => {
                info!("Transport recovered; leaving polling fallback");
                break;
            }
            Err(error) => debug!(error = %error, "Recovery attempt failed"),
        }
    }
}
