//! Pluggable transports carrying framed JSON-RPC messages between peers.
//!
//! Every concrete transport (`stdio`, `tcp`, `ipc`, `websocket`, `worker`) implements the
//! [`Transport`] trait below. Grounded on the teacher's `transport.rs`/`stdio.rs`, which each
//! hardcoded one specific I/O pair (`stdin`/`stdout`, or a generic `AsyncRead`/`AsyncWrite` pair)
//! directly into a `Server::serve` method; here that read/decode/dispatch loop is factored into
//! [`io::spawn_io_transport`], shared by every transport built on top of a plain byte stream.

pub mod ipc;
pub mod stdio;
pub mod tcp;
#[cfg(feature = "websocket")]
pub mod websocket;
pub mod worker;

mod io;

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::jsonrpc::Message;

pub use self::io::spawn_io_transport;

/// The lifecycle state of a transport's underlying connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportState {
    /// Not yet connected, or reconnecting after a drop.
    Connecting,
    /// Ready to send and receive messages.
    Connected,
    /// The connection has dropped and no reconnection is in progress or permitted.
    Disconnected,
    /// `close` was called; this transport will never reconnect.
    Closed,
}

/// An error encountered while sending, receiving, or maintaining a transport connection.
#[derive(Debug)]
pub struct TransportError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    /// Builds an error with no deeper cause.
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
            source: None,
        }
    }

    /// Builds an error wrapping a lower-level cause.
    pub fn wrap(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TransportError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Backoff schedule governing automatic reconnection for transports that support it (`tcp`,
/// `websocket`).
///
/// Grounded in the same typed-builder-struct idiom this crate's other configuration knobs use
/// (`CapabilityMode`, `concurrency_level`); there's no teacher precedent for reconnection itself,
/// since `tower-lsp` only ever ran over a single long-lived stdio/TCP stream.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Maximum number of attempts before giving up, or `None` to retry forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// No automatic reconnection: a dropped connection transitions straight to `Disconnected`.
    pub fn none() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_attempts: Some(0),
        }
    }

    /// Returns the delay to use before the `attempt`-th reconnection attempt (0-indexed),
    /// or `None` if `attempt` exceeds `max_attempts`.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Some(Duration::from_secs_f64(scaled).min(self.max_delay.max(self.initial_delay)))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Boxed callback invoked for every message a transport receives.
pub type MessageListener = Box<dyn Fn(&Message) + Send + Sync>;
/// Boxed callback invoked when a transport encounters a non-fatal error.
pub type ErrorListener = Box<dyn Fn(&TransportError) + Send + Sync>;
/// Boxed callback invoked once a transport closes.
pub type CloseListener = Box<dyn Fn() + Send + Sync>;

/// A disposable handle returned by a listener-registration method on [`Listeners`].
///
/// Mirrors [`crate::registry::Registration`] and [`crate::cancellation::ListenerRegistration`]:
/// dropping it leaves the listener registered, `dispose` must be called to remove it.
pub struct Disposable {
    remove: Box<dyn FnOnce() + Send>,
}

impl Disposable {
    /// Unregisters the associated listener.
    pub fn dispose(self) {
        (self.remove)();
    }

    /// Combines several disposables into one; disposing it disposes all of them, in order.
    pub fn combine(disposables: Vec<Disposable>) -> Disposable {
        Disposable {
            remove: Box::new(move || {
                for disposable in disposables {
                    disposable.dispose();
                }
            }),
        }
    }
}

/// Shared bookkeeping for the three observer callbacks every transport exposes, so each concrete
/// transport doesn't have to reimplement slot management and id allocation.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicUsize,
    on_message: Mutex<Vec<(usize, MessageListener)>>,
    on_error: Mutex<Vec<(usize, ErrorListener)>>,
    on_close: Mutex<Vec<(usize, CloseListener)>>,
}

impl Listeners {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Listeners::default())
    }

    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add_message(self: &Arc<Self>, listener: MessageListener) -> Disposable {
        let id = self.next_id();
        self.on_message.lock().unwrap().push((id, listener));
        let this = self.clone();
        Disposable {
            remove: Box::new(move || this.on_message.lock().unwrap().retain(|(i, _)| *i != id)),
        }
    }

    pub(crate) fn add_error(self: &Arc<Self>, listener: ErrorListener) -> Disposable {
        let id = self.next_id();
        self.on_error.lock().unwrap().push((id, listener));
        let this = self.clone();
        Disposable {
            remove: Box::new(move || this.on_error.lock().unwrap().retain(|(i, _)| *i != id)),
        }
    }

    pub(crate) fn add_close(self: &Arc<Self>, listener: CloseListener) -> Disposable {
        let id = self.next_id();
        self.on_close.lock().unwrap().push((id, listener));
        let this = self.clone();
        Disposable {
            remove: Box::new(move || this.on_close.lock().unwrap().retain(|(i, _)| *i != id)),
        }
    }

    pub(crate) fn notify_message(&self, message: &Message) {
        for (_, listener) in self.on_message.lock().unwrap().iter() {
            listener(message);
        }
    }

    pub(crate) fn notify_error(&self, error: &TransportError) {
        for (_, listener) in self.on_error.lock().unwrap().iter() {
            listener(error);
        }
    }

    pub(crate) fn notify_close(&self) {
        for (_, listener) in self.on_close.lock().unwrap().iter() {
            listener();
        }
    }
}

/// Common interface implemented by every concrete transport.
///
/// Listener-registration methods take already-boxed closures rather than a generic `F: Fn(..)` so
/// that `Transport` stays object-safe: sessions hold transports as `Arc<dyn Transport>` to stay
/// agnostic about which concrete transport backs a connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one message to the peer.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Registers a listener invoked for every message received from the peer.
    fn on_message(&self, listener: MessageListener) -> Disposable;

    /// Registers a listener invoked when the transport encounters a non-fatal error.
    fn on_error(&self, listener: ErrorListener) -> Disposable;

    /// Registers a listener invoked once the transport closes, whether requested or not.
    fn on_close(&self, listener: CloseListener) -> Disposable;

    /// Closes the transport. No further reconnection is attempted afterward.
    async fn close(&self);

    /// Returns the transport's current connection state.
    fn state(&self) -> TransportState;

    /// Returns `true` if the transport is currently able to send and receive messages.
    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_policy_backs_off_exponentially() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: None,
        };

        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(400)));
    }

    #[test]
    fn reconnect_policy_caps_at_max_delay() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 10.0,
            max_delay: Duration::from_millis(500),
            max_attempts: None,
        };

        assert_eq!(policy.delay_for(5), Some(Duration::from_millis(500)));
    }

    #[test]
    fn reconnect_policy_exhausts_after_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..ReconnectPolicy::default()
        };

        assert!(policy.delay_for(2).is_some());
        assert!(policy.delay_for(3).is_none());
    }

    #[test]
    fn none_policy_never_retries() {
        assert!(ReconnectPolicy::none().delay_for(0).is_none());
    }

    #[test]
    fn listener_fires_until_disposed() {
        let listeners = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count2 = count.clone();
        let handle = listeners.add_close(Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.notify_close();
        handle.dispose();
        listeners.notify_close();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
