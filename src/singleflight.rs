use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use parking_lot::Mutex;

type Flight<T> = Shared<BoxFuture<'static, T>>;

struct Entry<T> {
    id: u64,
    key: u64,
    flight: WeakShared<BoxFuture<'static, T>>,
}

struct Slot<T> {
    next_id: u64,
    entry: Option<Entry<T>>,
}

/// At most one in-progress operation per key; concurrent callers share its
/// outcome.
///
/// The slot is claimed synchronously inside [`SingleFlight::join_or_start`],
/// before the caller first awaits, so two tasks interleaving on one executor can
/// never both start an operation. The operation clears the slot itself when it
/// completes. The slot only holds a weak handle: once every caller has dropped
/// its future the operation is gone and the next call starts a fresh one.
pub(crate) struct SingleFlight<T: Clone> {
    slot: Arc<Mutex<Slot<T>>>,
}

/// Whether [`SingleFlight::join_or_start`] started a new flight or joined one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Leader,
    Follower,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                next_id: 0,
                entry: None,
            })),
        }
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.slot
            .lock()
            .entry
            .as_ref()
            .is_some_and(|entry| entry.flight.upgrade().is_some())
    }

    /// Join the in-flight operation started under `key`, or start one with
    /// `start`.
    ///
    /// `start` is invoked when nothing is in flight, when every caller of the
    /// previous operation has gone away, or when the previous operation was
    /// started under another key. The returned future keeps driving the
    /// operation even if the leader is dropped, as long as any follower still
    /// awaits it.
    pub(crate) fn join_or_start<F, Fut>(&self, key: u64, start: F) -> (Role, Flight<T>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(entry) = slot.entry.as_ref().filter(|entry| entry.key == key) {
            if let Some(flight) = entry.flight.upgrade() {
                return (Role::Follower, flight);
            }
        }

        slot.next_id += 1;
        let id = slot.next_id;
        let release = Arc::clone(&self.slot);
        let operation = start();
        let flight = async move {
            let outcome = operation.await;
            let mut slot = release.lock();
            if slot.entry.as_ref().is_some_and(|entry| entry.id == id) {
                slot.entry = None;
            }
            outcome
        }
        .boxed()
        .shared();

        slot.entry = flight.downgrade().map(|weak| Entry { id, key, flight: weak });
        (Role::Leader, flight)
    }
}
