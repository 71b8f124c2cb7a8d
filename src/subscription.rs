//! Subscription plumbing: the snapshot callback contract and the detach
//! handle returned by every `subscribe_*` operation.

use tokio::task::JoinHandle;

/// Receives full snapshots from a live subscription.
///
/// Every delivery replaces the previous one; sinks never see diffs.
/// Implemented for any `Fn(T)` closure, so callers can pass a closure
/// directly instead of defining a type.
pub trait SnapshotSink<T>: Send + Sync {
    fn publish(&self, snapshot: T);
}

impl<T, F> SnapshotSink<T> for F
where
    F: Fn(T) + Send + Sync,
{
    fn publish(&self, snapshot: T) {
        self(snapshot);
    }
}

/// Handle to a live subscription.
///
/// Dropping the handle detaches the subscription, so replacing a stored
/// handle is guaranteed to stop the old stream before the new one takes its
/// place.  Detaching stops further callbacks; it does not cancel store
/// writes already in flight.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Explicitly stop the subscription.
    pub fn detach(self) {
        // Drop does the work.
    }

    /// Whether the subscription task has ended on its own (store dropped).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
