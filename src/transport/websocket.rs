//! Transport over a WebSocket connection, either as a client dialing a URL or wrapping an already
//! accepted server-side socket.
//!
//! Grounded in the same `Transport` shape as `io::IoTransport`, but driven directly off
//! `tokio-tungstenite`'s `WebSocketStream` rather than a `FramedRead`/`FramedWrite` pair: WebSocket
//! already frames messages at the protocol level (one `Message::Text` per JSON-RPC message), so the
//! `Content-Length` codec this crate otherwise relies on does not apply here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use super::{
    CloseListener, Disposable, ErrorListener, Listeners, MessageListener, ReconnectPolicy, Transport,
    TransportError, TransportState,
};
use crate::jsonrpc::Message;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials `url` and returns a client transport over the resulting WebSocket, reconnecting according
/// to `policy` if the connection drops, mirroring [`super::tcp::connect`].
pub async fn connect(url: &str, policy: ReconnectPolicy) -> Result<Arc<dyn Transport>, TransportError> {
    let socket = dial(url).await?;
    Ok(Arc::new(ReconnectingWebSocketTransport::new(
        url.to_string(),
        policy,
        socket,
    )))
}

async fn dial(url: &str) -> Result<Socket, TransportError> {
    let (socket, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::wrap("failed to establish websocket connection", e))?;
    Ok(socket)
}

/// A client-side WebSocket transport that reconnects to its URL in the background according to a
/// [`ReconnectPolicy`] when the underlying connection drops. Only meaningful for URL-dialed sockets;
/// [`from_socket`] wraps an already-accepted server-side connection, which has no URL to redial.
struct ReconnectingWebSocketTransport {
    listeners: Arc<Listeners>,
    inner: Arc<Mutex<Arc<WebSocketTransport>>>,
    closed: Arc<AtomicBool>,
}

impl ReconnectingWebSocketTransport {
    fn new(url: String, policy: ReconnectPolicy, socket: Socket) -> Self {
        let listeners = Listeners::new();
        let inner = Arc::new(WebSocketTransport::new(socket));
        let closed = Arc::new(AtomicBool::new(false));
        let slot = Arc::new(Mutex::new(inner.clone()));

        wire_forwarding(&inner, &listeners);
        spawn_reconnect_watch(url, policy, inner, slot.clone(), listeners.clone(), closed.clone());

        ReconnectingWebSocketTransport {
            listeners,
            inner: slot,
            closed,
        }
    }
}

fn wire_forwarding(inner: &Arc<WebSocketTransport>, listeners: &Arc<Listeners>) {
    let l = listeners.clone();
    inner.on_message(Box::new(move |msg: &Message| l.notify_message(msg)));
    let l = listeners.clone();
    inner.on_error(Box::new(move |err: &TransportError| l.notify_error(err)));
}

fn spawn_reconnect_watch(
    url: String,
    policy: ReconnectPolicy,
    inner: Arc<WebSocketTransport>,
    slot: Arc<Mutex<Arc<WebSocketTransport>>>,
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
                warn!("giving up reconnecting to {url} after {attempt} attempts");
                listeners.notify_close();
                return;
            };
            tokio::time::sleep(delay).await;

            match dial(&url).await {
                Ok(socket) => {
                    info!("reconnected to {url}");
                    let new_inner = Arc::new(WebSocketTransport::new(socket));
                    wire_forwarding(&new_inner, &listeners);
                    *slot.lock().unwrap() = new_inner.clone();
                    spawn_reconnect_watch(url, policy, new_inner, slot, listeners, closed);
                    return;
                }
                Err(err) => {
                    error!("reconnect attempt {attempt} to {url} failed: {err}");
                    attempt += 1;
                }
            }
        }
    });
}

#[async_trait]
impl Transport for ReconnectingWebSocketTransport {
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

/// Wraps an already-established server-side WebSocket connection (after the HTTP upgrade
/// handshake has completed) as a transport.
pub fn from_socket(socket: Socket) -> Arc<dyn Transport> {
    Arc::new(WebSocketTransport::new(socket))
}

struct WebSocketTransport {
    listeners: Arc<Listeners>,
    outbound: Mutex<Option<futures::channel::mpsc::Sender<Message>>>,
    connected: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WebSocketTransport {
    fn new(socket: Socket) -> Self {
        let listeners = Listeners::new();
        let connected = Arc::new(AtomicBool::new(true));
        let (outbound_tx, mut outbound_rx) = futures::channel::mpsc::channel::<Message>(100);

        let task_listeners = listeners.clone();
        let task_connected = connected.clone();
        let task = tokio::spawn(async move {
            let (mut sink, mut stream) = socket.split();

            loop {
                tokio::select! {
                    incoming = stream.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<Message>(&text) {
                                    Ok(message) => task_listeners.notify_message(&message),
                                    Err(err) => task_listeners.notify_error(
                                        &TransportError::wrap("failed to decode message", err),
                                    ),
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                task_listeners.notify_error(&TransportError::wrap("websocket error", err));
                                break;
                            }
                        }
                    }
                    outgoing = outbound_rx.next() => {
                        match outgoing {
                            Some(message) => {
                                let text = match serde_json::to_string(&message) {
                                    Ok(text) => text,
                                    Err(err) => {
                                        task_listeners.notify_error(
                                            &TransportError::wrap("failed to encode message", err),
                                        );
                                        continue;
                                    }
                                };
                                if let Err(err) = sink.send(WsMessage::Text(text)).await {
                                    task_listeners.notify_error(&TransportError::wrap("failed to send message", err));
                                }
                            }
                            None => break,
                        }
                    }
                }
            }

            task_connected.store(false, Ordering::SeqCst);
            task_listeners.notify_close();
        });

        WebSocketTransport {
            listeners,
            outbound: Mutex::new(Some(outbound_tx)),
            connected,
            task: Mutex::new(Some(task)),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let sender = self.outbound.lock().unwrap().clone();
        match sender {
            Some(mut sender) => sender
                .send(message)
                .await
                .map_err(|_| TransportError::new("transport is closed")),
            None => Err(TransportError::new("transport is closed")),
        }
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
        self.outbound.lock().unwrap().take();
        if let Some(task) = self.task.lock().unwrap().take() {
            if let Err(err) = task.await {
                warn!("websocket transport task panicked: {err}");
            }
        }
    }

    fn state(&self) -> TransportState {
        if self.connected.load(Ordering::SeqCst) {
            TransportState::Connected
        } else {
            TransportState::Disconnected
        }
    }
}
