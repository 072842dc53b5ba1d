//! Latest-value subject with change suppression.
//!
//! Wraps a `tokio::sync::watch` channel. Every publish replaces the whole
//! value, and a value the equality predicate considers unchanged is not
//! announced to subscribers.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

type Equality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// A multi-subscriber snapshot holder.
pub struct Observable<T> {
    tx: watch::Sender<T>,
    same: Equality<T>,
}

impl<T: PartialEq + Send + Sync + 'static> Observable<T> {
    /// Creates an observable that compares snapshots with `PartialEq`
    pub fn new(initial: T) -> Self {
        Self::with_equality(initial, |a: &T, b: &T| a == b)
    }
}

impl<T> Observable<T> {
    /// Creates an observable with a custom equality predicate
    pub fn with_equality<F>(initial: T, same: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            same: Arc::new(same),
        }
    }

    /// Replaces the current snapshot. Returns true if subscribers were notified.
    pub fn publish(&self, value: T) -> bool {
        let same = self.same.as_ref();
        self.tx.send_if_modified(move |current| {
            if same(current, &value) {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Returns a receiver that starts at the current snapshot
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Observable<T> {
    /// Returns a copy of the current snapshot
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*self.tx.borrow())
            .finish()
    }
}
