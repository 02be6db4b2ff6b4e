//! TCP client and server transports, with automatic reconnection on the client side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use super::io::IoTransport;
use super::{
    CloseListener, Disposable, ErrorListener, Listeners, MessageListener, ReconnectPolicy,
    Transport, TransportError, TransportState,
};
use crate::jsonrpc::Message;

/// Connects to `addr` over TCP, reconnecting according to `policy` if the connection drops.
pub async fn connect(addr: SocketAddr, policy: ReconnectPolicy) -> Result<Arc<dyn Transport>, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::wrap("failed to connect", e))?;

    Ok(Arc::new(ReconnectingTcpTransport::new(addr, policy, stream)))
}

/// Binds `addr` and accepts TCP connections, serving exactly one peer at a time.
///
/// Awaits the first connection and returns a transport wired to it, matching the teacher's stdio
/// server, which likewise assumed exactly one client per process. Unlike `listen_once`, the
/// listener keeps running afterward in the background: a connection attempt while the current peer
/// is still active is accepted only to be immediately dropped, with an error reported to the
/// transport's error observers, matching the "one concurrent peer, extra connections rejected"
/// contract. Once the active peer disconnects, the next accepted connection becomes the new peer.
pub async fn listen(addr: SocketAddr) -> Result<Arc<dyn Transport>, TransportError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| TransportError::wrap("failed to bind", e))?;

    let (stream, peer) = listener
        .accept()
        .await
        .map_err(|e| TransportError::wrap("failed to accept connection", e))?;
    info!("accepted TCP connection from {peer}");

    let (read, write) = stream.into_split();
    let inner = Arc::new(IoTransport::new(read, write));
    let listeners = Listeners::new();
    let occupied = Arc::new(AtomicBool::new(true));
    let slot = Arc::new(Mutex::new(inner.clone()));

    wire_forwarding(&inner, &listeners);
    watch_occupancy(&inner, occupied.clone());
    spawn_accept_loop(listener, slot.clone(), listeners.clone(), occupied);

    Ok(Arc::new(TcpServerTransport {
        listeners,
        inner: slot,
        closed: Arc::new(AtomicBool::new(false)),
    }))
}

/// Accepts a single TCP connection on `addr` and returns a transport for it.
///
/// Unlike [`listen`], the listener is dropped as soon as the first peer connects: no further
/// connections, rejected or otherwise, are accepted afterward. Useful for tests and callers that
/// already enforce single-peer semantics at a higher level.
pub async fn listen_once(addr: SocketAddr) -> Result<Arc<dyn Transport>, TransportError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| TransportError::wrap("failed to bind", e))?;

    let (stream, peer) = listener
        .accept()
        .await
        .map_err(|e| TransportError::wrap("failed to accept connection", e))?;
    info!("accepted TCP connection from {peer}");

    let (read, write) = stream.into_split();
    Ok(Arc::new(IoTransport::new(read, write)))
}

fn watch_occupancy(inner: &Arc<IoTransport>, occupied: Arc<AtomicBool>) {
    inner.on_close(Box::new(move || {
        occupied.store(false, Ordering::SeqCst);
    }));
}

/// Keeps accepting connections on `listener` after the first peer is already being served,
/// rejecting any that arrive while `occupied` is set and otherwise promoting the new connection to
/// be the active peer.
fn spawn_accept_loop(
    listener: TcpListener,
    slot: Arc<Mutex<Arc<IoTransport>>>,
    listeners: Arc<Listeners>,
    occupied: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    listeners.notify_error(&TransportError::wrap("failed to accept connection", err));
                    continue;
                }
            };

            if occupied.load(Ordering::SeqCst) {
                warn!("rejecting additional TCP connection from {peer}: a peer is already connected");
                listeners.notify_error(&TransportError::new(format!(
                    "rejected additional connection from {peer}: only one concurrent peer is served"
                )));
                drop(stream);
                continue;
            }

            info!("accepted TCP connection from {peer}");
            let (read, write) = stream.into_split();
            let new_inner = Arc::new(IoTransport::new(read, write));
            wire_forwarding(&new_inner, &listeners);
            occupied.store(true, Ordering::SeqCst);
            watch_occupancy(&new_inner, occupied.clone());
            *slot.lock().unwrap() = new_inner;
        }
    });
}

/// A server-side TCP transport serving exactly one concurrent peer; additional connection attempts
/// while a peer is active are accepted then immediately dropped, with an error reported.
struct TcpServerTransport {
    listeners: Arc<Listeners>,
    inner: Arc<Mutex<Arc<IoTransport>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for TcpServerTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let inner = self.inner.lock().unwrap().clone();
        inner.send(message).await
    }

    fn on_message(&self, listener: MessageListener) -> Disposable {
        self.listeners.add_message(listener)
    }

    fn on_error(&self, listener: ErrorListener) -> Disposable {
        self.listeners.add_error(listener)
    }

    fn on_close(&self, listener: CloseListener) -> Disposable {
        self.listeners.add_close(listener)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap().clone();
        inner.close().await;
    }

    fn state(&self) -> TransportState {
        if self.closed.load(Ordering::SeqCst) {
            TransportState::Closed
        } else {
            self.inner.lock().unwrap().state()
        }
    }
}

/// A client-side TCP transport that reconnects in the background according to a [`ReconnectPolicy`]
/// when the underlying connection drops.
struct ReconnectingTcpTransport {
    listeners: Arc<Listeners>,
    inner: Arc<Mutex<Arc<IoTransport>>>,
    closed: Arc<AtomicBool>,
}

impl ReconnectingTcpTransport {
    fn new(addr: SocketAddr, policy: ReconnectPolicy, stream: TcpStream) -> Self {
        let listeners = Listeners::new();
        let (read, write) = stream.into_split();
        let inner = Arc::new(IoTransport::new(read, write));
        let closed = Arc::new(AtomicBool::new(false));
        let slot = Arc::new(Mutex::new(inner.clone()));

        wire_forwarding(&inner, &listeners);
        spawn_reconnect_watch(addr, policy, inner, slot.clone(), listeners.clone(), closed.clone());

        ReconnectingTcpTransport {
            listeners,
            inner: slot,
            closed,
        }
    }
}

fn wire_forwarding(inner: &Arc<IoTransport>, listeners: &Arc<Listeners>) {
    let l = listeners.clone();
    inner.on_message(Box::new(move |msg: &Message| l.notify_message(msg)));
    let l = listeners.clone();
    inner.on_error(Box::new(move |err: &TransportError| l.notify_error(err)));
}

/// Watches `inner` for closure and, once it drops, reconnects in the background and swaps the
/// freshly connected transport into `slot` so that subsequent `send`/`close`/`state` calls made
/// through the outer [`ReconnectingTcpTransport`] route to the live connection.
fn spawn_reconnect_watch(
    addr: SocketAddr,
    policy: ReconnectPolicy,
    inner: Arc<IoTransport>,
    slot: Arc<Mutex<Arc<IoTransport>>>,
    listeners: Arc<Listeners>,
    closed: Arc<AtomicBool>,
) {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    inner.on_close(Box::new(move || {
        let _ = tx.send(());
    }));

    tokio::spawn(async move {
        if rx.await.is_err() || closed.load(Ordering::SeqCst) {
            return;
        }

        let mut attempt = 0;
        loop {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let Some(delay) = policy.delay_for(attempt) else {
                warn!("giving up reconnecting to {addr} after {attempt} attempts");
                listeners.notify_close();
                return;
            };
            tokio::time::sleep(delay).await;

            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!("reconnected to {addr}");
                    let (read, write) = stream.into_split();
                    let new_inner = Arc::new(IoTransport::new(read, write));
                    wire_forwarding(&new_inner, &listeners);
                    *slot.lock().unwrap() = new_inner.clone();
                    spawn_reconnect_watch(addr, policy, new_inner, slot, listeners, closed);
                    return;
                }
                Err(err) => {
                    error!("reconnect attempt {attempt} to {addr} failed: {err}");
                    attempt += 1;
                }
            }
        }
    });
}

#[async_trait]
impl Transport for ReconnectingTcpTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let inner = self.inner.lock().unwrap().clone();
        inner.send(message).await
    }

    fn on_message(&self, listener: MessageListener) -> Disposable {
        self.listeners.add_message(listener)
    }

    fn on_error(&self, listener: ErrorListener) -> Disposable {
        self.listeners.add_error(listener)
    }

    fn on_close(&self, listener: CloseListener) -> Disposable {
        self.listeners.add_close(listener)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap().clone();
        inner.close().await;
    }

    fn state(&self) -> TransportState {
        if self.closed.load(Ordering::SeqCst) {
            TransportState::Closed
        } else {
            self.inner.lock().unwrap().state()
        }
    }
}
