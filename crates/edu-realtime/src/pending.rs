//! Lock-free pending acknowledgment management using `scc::HashMap`.
//!
//! Tracks sends awaiting a correlated acknowledgment. Deadlines are enforced
//! by the waiting caller; this store only owns the resolvers.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::{
    error::{RealtimeError, RealtimeResult},
    types::{CorrelationId, InboundMessage, Topic},
};

/// Receiver half handed to the sender of an acknowledged message.
pub(crate) type AckReceiver = oneshot::Receiver<RealtimeResult<InboundMessage>>;

/// A send awaiting its acknowledgment.
pub(crate) struct PendingAck {
    resolver: oneshot::Sender<RealtimeResult<InboundMessage>>,
    topic: Option<Topic>,
    created_at: Instant,
    deadline: Instant,
}

/// Store of outstanding acknowledgments, at most one per correlation id.
pub(crate) struct PendingAckStore {
    acks: scc::HashMap<CorrelationId, PendingAck>,
    max_pending: usize,
}

impl PendingAckStore {
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            acks: scc::HashMap::new(),
            max_pending,
        }
    }

    /// Register a pending acknowledgment.
    ///
    /// Fails if the store is full or `id` is already pending.
    pub(crate) fn add(
        &self,
        id: CorrelationId,
        topic: Option<Topic>,
        timeout: Duration,
    ) -> RealtimeResult<AckReceiver> {
        if self.acks.len() >= self.max_pending {
            return Err(RealtimeError::send_failed(format!(
                "too many pending acknowledgments ({})",
                self.max_pending
            )));
        }

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let pending = PendingAck {
            resolver: tx,
            topic,
            created_at: now,
            deadline: now + timeout,
        };

        if let Err((id, _)) = self.acks.insert_sync(id, pending) {
            return Err(RealtimeError::send_failed(format!(
                "acknowledgment {id} is already pending"
            )));
        }

        Ok(rx)
    }

    /// Resolve the acknowledgment for `id` with `message`.
    ///
    /// Returns the round-trip time if a pending entry was found.
    pub(crate) fn resolve(&self, id: &CorrelationId, message: InboundMessage) -> Option<Duration> {
        let (_, pending) = self.acks.remove_sync(id)?;
        let round_trip = pending.created_at.elapsed();
        if let (Some(expected), Some(got)) = (pending.topic.as_ref(), message.topic())
            && expected != got
        {
            tracing::debug!(
                correlation_id = %id,
                %expected,
                %got,
                "Acknowledgment topic differs from send topic"
            );
        }
        // Receiver may have given up already.
        let _ = pending.resolver.send(Ok(message));
        Some(round_trip)
    }

    /// Remove a pending acknowledgment without notifying the waiter.
    pub(crate) fn remove(&self, id: &CorrelationId) -> bool {
        self.acks.remove_sync(id).is_some()
    }

    /// Drop entries whose deadline has passed and notify their waiters.
    pub(crate) fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();

        self.acks.retain_sync(|id, pending| {
            if now >= pending.deadline {
                expired.push(id.clone());
            }
            true
        });

        let mut count = 0;
        for id in expired {
            if let Some((_, pending)) = self.acks.remove_sync(&id) {
                let waited = pending.deadline.duration_since(pending.created_at);
                let _ = pending
                    .resolver
                    .send(Err(RealtimeError::ack_timeout(id.to_string(), waited)));
                count += 1;
            }
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.acks.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    /// Reject every pending acknowledgment with a cancellation error.
    pub(crate) fn clear_with_error(&self, reason: &str) -> usize {
        let mut ids = Vec::new();
        self.acks.retain_sync(|id, _| {
            ids.push(id.clone());
            true
        });

        let mut count = 0;
        for id in ids {
            if let Some((_, pending)) = self.acks.remove_sync(&id) {
                let _ = pending
                    .resolver
                    .send(Err(RealtimeError::cancelled(reason.to_string())));
                count += 1;
            }
        }
        count
    }
}
