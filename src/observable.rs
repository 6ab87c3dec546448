use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

type Callback<T> = dyn Fn(&T) + Send + Sync;

/// Observable value with change notification.
///
/// The holder owns the value; subscribers are kept as weak handles so dropping a
/// [`Subscription`] is enough to stop receiving updates. Callbacks run after
/// internal locks are released and may read the observable again.
pub struct Observable<T> {
    value: RwLock<T>,
    subscribers: Mutex<Vec<Weak<Callback<T>>>>,
}

/// Keeps a subscriber alive. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription<T> {
    _callback: Arc<Callback<T>>,
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl<T: Clone + PartialEq> Observable<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Read the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    /// Replace the value. Subscribers are notified only if it changed.
    pub fn set(&self, value: T) {
        self.update(|current| *current = value);
    }

    /// Mutate the value in place. Subscribers are notified only if it changed.
    ///
    /// Returns what `f` returned.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let (result, changed) = {
            let mut guard = self.value.write();
            let before = (*guard).clone();
            let result = f(&mut guard);
            let changed = (*guard != before).then(|| (*guard).clone());
            (result, changed)
        };
        if let Some(snapshot) = changed {
            self.notify(&snapshot);
        }
        result
    }

    /// Register `callback` for future changes.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let callback: Arc<Callback<T>> = Arc::new(callback);
        self.subscribers.lock().push(Arc::downgrade(&callback));
        Subscription {
            _callback: callback,
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    fn notify(&self, value: &T) {
        let live: Vec<Arc<Callback<T>>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        for callback in live {
            callback(value);
        }
    }
}

impl<T: Clone + PartialEq + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*self.value.read())
            .finish_non_exhaustive()
    }
}
