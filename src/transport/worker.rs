//! In-process transports modeled on the browser's dedicated- and shared-worker messaging model:
//! an `mpsc` channel pair standing in for `postMessage`, with the shared-worker variant wrapping
//! each message in a `{clientId, message}` envelope so one hub can address many clients.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CloseListener, Disposable, ErrorListener, Listeners, MessageListener, Transport, TransportError, TransportState};
use crate::jsonrpc::Message;

/// A worker-local client identifier, allocated by the hub when a client connects.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct ClientId(u64);

/// The envelope a shared worker wraps every message in, so the hub can tell which client a message
/// came from (or is addressed to).
///
/// Messages that arrive without this wrapper are broadcast to every connected client, the fallback
/// a real `SharedWorker` port falls back to when a message isn't addressed to one connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Envelope {
    client_id: Option<ClientId>,
    message: Value,
}

/// One half of an in-process `mpsc` channel pair standing in for a dedicated worker's message port.
pub struct DedicatedWorkerTransport {
    listeners: Arc<Listeners>,
    outbound: futures::lock::Mutex<mpsc::Sender<Message>>,
    closed: std::sync::atomic::AtomicBool,
}

impl DedicatedWorkerTransport {
    /// Creates a connected pair of transports, as if two dedicated workers were talking to each
    /// other over `postMessage`.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::channel(32);
        let (b_tx, b_rx) = mpsc::channel(32);

        let a = Arc::new(DedicatedWorkerTransport {
            listeners: Listeners::new(),
            outbound: futures::lock::Mutex::new(b_tx),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let b = Arc::new(DedicatedWorkerTransport {
            listeners: Listeners::new(),
            outbound: futures::lock::Mutex::new(a_tx),
            closed: std::sync::atomic::AtomicBool::new(false),
        });

        spawn_forwarder(a_rx, a.listeners.clone());
        spawn_forwarder(b_rx, b.listeners.clone());

        (a, b)
    }
}

fn spawn_forwarder(mut rx: mpsc::Receiver<Message>, listeners: Arc<Listeners>) {
    tokio::spawn(async move {
        while let Some(message) = rx.next().await {
            listeners.notify_message(&message);
        }
        listeners.notify_close();
    });
}

#[async_trait]
impl Transport for DedicatedWorkerTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.outbound
            .lock()
            .await
            .send(message)
            .await
            .map_err(|_| TransportError::new("worker transport is closed"))
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
        self.outbound.lock().await.close_channel();
    }

    fn state(&self) -> TransportState {
        if self.closed.load(Ordering::SeqCst) {
            TransportState::Closed
        } else {
            TransportState::Connected
        }
    }
}

/// Per-client bookkeeping the hub keeps so a routed message only ever reaches the listeners of
/// the client it's addressed to.
struct ClientChannel {
    sender: mpsc::Sender<Message>,
    listeners: Arc<Listeners>,
}

/// A hub multiplexing several clients onto one logical transport, addressing each by a
/// hub-assigned [`ClientId`] wrapped in an [`Envelope`].
///
/// Each client gets its own [`Listeners`], keyed by [`ClientId`], so that a message routed to one
/// client's port never fires another client's observers.
pub struct SharedWorkerHub {
    next_client_id: AtomicU64,
    clients: DashMap<ClientId, ClientChannel>,
}

impl SharedWorkerHub {
    /// Creates an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(SharedWorkerHub {
            next_client_id: AtomicU64::new(1),
            clients: DashMap::new(),
        })
    }

    /// Connects a new client to the hub, returning its transport handle.
    pub fn connect(self: &Arc<Self>) -> Arc<SharedWorkerTransport> {
        let id = ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(32);
        let listeners = Listeners::new();
        self.clients.insert(
            id.clone(),
            ClientChannel {
                sender: tx,
                listeners: listeners.clone(),
            },
        );

        let hub = self.clone();
        let client_id = id.clone();
        let forwarder_listeners = listeners.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(message) = rx.next().await {
                forwarder_listeners.notify_message(&message);
            }
            forwarder_listeners.notify_close();
            hub.clients.remove(&client_id);
        });

        Arc::new(SharedWorkerTransport {
            hub: self.clone(),
            id,
            listeners,
        })
    }

    /// Delivers an inbound envelope to the client it is addressed to.
    ///
    /// A bare (unwrapped) message, one with no `clientId`, is broadcast to every connected client,
    /// mirroring a real `SharedWorker`'s `onconnect` fan-out when a message isn't addressed to a
    /// specific port. An addressed envelope is delivered only to that client, notifying only that
    /// client's own listeners.
    async fn route(&self, envelope: Envelope) -> Result<(), TransportError> {
        let message: Message = serde_json::from_value(envelope.message)
            .map_err(|e| TransportError::wrap("failed to decode routed message", e))?;

        match envelope.client_id {
            Some(id) => match self.clients.get(&id).map(|e| e.value().sender.clone()) {
                Some(mut sender) => sender
                    .send(message)
                    .await
                    .map_err(|_| TransportError::new("target client disconnected")),
                None => Err(TransportError::new("no client connected with that id")),
            },
            None => {
                if self.clients.is_empty() {
                    return Err(TransportError::new("no clients connected to broadcast to"));
                }
                let senders: Vec<_> = self.clients.iter().map(|e| e.value().sender.clone()).collect();
                for mut sender in senders {
                    let _ = sender.send(message.clone()).await;
                }
                Ok(())
            }
        }
    }
}

/// A single client's handle onto a [`SharedWorkerHub`].
pub struct SharedWorkerTransport {
    hub: Arc<SharedWorkerHub>,
    id: ClientId,
    listeners: Arc<Listeners>,
}

#[async_trait]
impl Transport for SharedWorkerTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let envelope = Envelope {
            client_id: Some(self.id.clone()),
            message: serde_json::to_value(&message)
                .map_err(|e| TransportError::wrap("failed to encode message", e))?,
        };
        self.hub.route(envelope).await
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
        self.hub.clients.remove(&self.id);
    }

    fn state(&self) -> TransportState {
        if self.hub.clients.contains_key(&self.id) {
            TransportState::Connected
        } else {
            TransportState::Closed
        }
    }
}
