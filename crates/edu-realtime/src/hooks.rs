//! Observer registry with explicit disposer handles.
//!
//! Every listener registered through this module is removed either through
//! its [`ListenerHandle`] or when the owning registry is cleared. Dropping a
//! handle does not unregister the listener.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::warn;

/// Something a [`ListenerHandle`] can detach itself from.
pub(crate) trait Detach: Send + Sync {
    /// Remove the listener with this id. Returns `true` if it was present.
    fn detach(&self, id: u64) -> bool;
}

/// Disposer returned by every registration method.
pub struct ListenerHandle {
    id: u64,
    owner: Weak<dyn Detach>,
    disposed: AtomicBool,
}

impl ListenerHandle {
    pub(crate) fn new(id: u64, owner: Weak<dyn Detach>) -> Self {
        Self {
            id,
            owner,
            disposed: AtomicBool::new(false),
        }
    }

    /// Deregister exactly the listener this handle was returned for.
    ///
    /// Returns `true` on the call that actually removed it; later calls and
    /// calls after the registry was cleared return `false`.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.owner
            .upgrade()
            .is_some_and(|owner| owner.detach(self.id))
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<T>)>>,
}

impl<T: 'static> Detach for ListenerSet<T> {
    fn detach(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }
}

/// Ordered list of observers for values of type `T`.
pub struct Listeners<T> {
    set: Arc<ListenerSet<T>>,
    label: &'static str,
}

impl<T: 'static> Listeners<T> {
    /// Create an empty registry. `label` only appears in log output.
    pub fn new(label: &'static str) -> Self {
        Self {
            set: Arc::new(ListenerSet {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
            label,
        }
    }

    /// Register an observer; it runs after every observer registered before it.
    pub fn add<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.set.next_id.fetch_add(1, Ordering::Relaxed);
        self.set.entries.lock().push((id, Arc::new(callback)));
        let owner: Arc<dyn Detach> = self.set.clone();
        ListenerHandle::new(id, Arc::downgrade(&owner))
    }

    /// Invoke every observer with `value`.
    ///
    /// The list is snapshotted first, so observers may register or dispose
    /// listeners while being called. A panicking observer is logged and
    /// skipped.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .set
            .entries
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                warn!(listeners = self.label, "Observer panicked; continuing");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.set.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.entries.lock().is_empty()
    }

    /// Remove every observer. Outstanding handles become no-ops.
    pub fn clear(&self) {
        self.set.entries.lock().clear();
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("label", &self.label)
            .field("count", &self.set.entries.lock().len())
            .finish()
    }
}
