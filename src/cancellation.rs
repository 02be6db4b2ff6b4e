//! Cancellation sources and tokens shared by in-flight requests on either side of a session.

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Creates a cancellation token paired with the source that controls it.
///
/// The source is owned by whoever needs the power to cancel (the pending-request tracker, for an
/// outbound call; the dispatcher, for an inbound one); the token is handed to the operation that
/// should observe cancellation.
pub fn cancellation_pair() -> (CancellationSource, CancellationToken) {
    let shared = Arc::new(Shared {
        cancelled: AtomicBool::new(false),
        listeners: Mutex::new(Vec::new()),
    });

    (
        CancellationSource {
            shared: shared.clone(),
        },
        CancellationToken { shared },
    )
}

struct Shared {
    cancelled: AtomicBool,
    listeners: Mutex<Vec<Option<Box<dyn FnOnce() + Send>>>>,
}

/// The write half of a cancellation pair. Only the source may cancel its token.
pub struct CancellationSource {
    shared: Arc<Shared>,
}

impl CancellationSource {
    /// Cancels the paired token, firing every registered listener exactly once.
    ///
    /// Idempotent: the first call performs the state flip and listener fan-out; every call after
    /// that is a no-op, including concurrent calls racing each other.
    pub fn cancel(&self) {
        if self
            .shared
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let listeners = std::mem::take(&mut *self.shared.listeners.lock().unwrap());
            for listener in listeners.into_iter().flatten() {
                listener();
            }
        }
    }

    /// Returns a fresh token observing this same source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: self.shared.clone(),
        }
    }
}

impl Debug for CancellationSource {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.shared.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

/// The read half of a cancellation pair.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    /// Returns `true` if the paired source has already cancelled.
    pub fn is_cancellation_requested(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Registers a listener to run when the token is cancelled.
    ///
    /// If the token has already been cancelled, the listener runs immediately instead of being
    /// queued. Returns a [`ListenerRegistration`] whose `dispose` removes the listener before it
    /// fires, if it hasn't already.
    pub fn on_cancelled<F>(&self, listener: F) -> ListenerRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_cancellation_requested() {
            listener();
            return ListenerRegistration {
                shared: None,
                index: 0,
            };
        }

        let mut listeners = self.shared.listeners.lock().unwrap();
        // Re-check under the lock: cancellation may have raced us since the fast check above.
        if self.shared.cancelled.load(Ordering::SeqCst) {
            drop(listeners);
            listener();
            return ListenerRegistration {
                shared: None,
                index: 0,
            };
        }

        listeners.push(Some(Box::new(listener)));
        ListenerRegistration {
            shared: Some(self.shared.clone()),
            index: listeners.len() - 1,
        }
    }
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancellation_requested())
            .finish()
    }
}

/// A disposable handle returned by [`CancellationToken::on_cancelled`].
///
/// Disposing it before cancellation fires removes the listener without invoking it. Disposing it
/// after cancellation has already fired (or not disposing it at all) is harmless.
pub struct ListenerRegistration {
    shared: Option<Arc<Shared>>,
    index: usize,
}

impl ListenerRegistration {
    /// Removes the listener if it has not fired yet.
    pub fn dispose(self) {
        if let Some(shared) = self.shared {
            if let Some(slot) = shared.listeners.lock().unwrap().get_mut(self.index) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn cancel_fires_listener_exactly_once() {
        let (source, token) = cancellation_pair();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = calls.clone();
        token.on_cancelled(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        source.cancel();
        source.cancel();
        source.cancel();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_added_after_cancel_fires_immediately() {
        let (source, token) = cancellation_pair();
        source.cancel();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        token.on_cancelled(move || fired2.store(true, Ordering::SeqCst));

        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn token_reports_cancellation_state() {
        let (source, token) = cancellation_pair();
        assert!(!token.is_cancellation_requested());
        source.cancel();
        assert!(token.is_cancellation_requested());
    }

    #[test]
    fn multiple_listeners_all_fire() {
        let (source, token) = cancellation_pair();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let calls = calls.clone();
            token.on_cancelled(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        source.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
