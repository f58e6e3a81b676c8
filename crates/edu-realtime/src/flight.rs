//! Single-flight slot: concurrent callers of the same operation share one
//! in-flight future.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;

use crate::error::RealtimeResult;

pub(crate) type SharedResult<T> = Shared<BoxFuture<'static, RealtimeResult<T>>>;

type Slot<T> = Arc<Mutex<Option<(u64, SharedResult<T>)>>>;

pub(crate) struct SingleFlight<T> {
    slot: Slot<T>,
    next_id: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the in-flight operation, or start one with `start`.
    ///
    /// `start` is only called when nothing is in flight. The slot is freed
    /// as soon as the operation finishes, so the next call starts afresh.
    pub(crate) fn join_or_start<F, Fut>(&self, start: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RealtimeResult<T>> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some((_, inflight)) = slot.as_ref() {
            return inflight.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let owner = Arc::downgrade(&self.slot);
        let operation = start();
        let shared = async move {
            let result = operation.await;
            if let Some(owner) = owner.upgrade() {
                let mut slot = owner.lock();
                if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                    *slot = None;
                }
            }
            result
        }
        .boxed()
        .shared();

        *slot = Some((id, shared.clone()));
        shared
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self) -> bool {
        self.slot.lock().is_some()
    }
}
