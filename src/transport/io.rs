//! Drives a framed, bidirectional byte stream as a [`Transport`], shared by `stdio`, `tcp`, and
//! `ipc`.
//!
//! Grounded on the teacher's `transport.rs::Server::serve`, which combined a `FramedRead` and a
//! `FramedWrite` over one read/write loop using `futures::join!`; this generalizes that loop into a
//! spawned background task reusable by any transport backed by `AsyncRead + AsyncWrite`, decoupled
//! from the request/response dispatch semantics that lived alongside it in the teacher (now the
//! dispatcher's job, not the transport's).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::warn;

use super::{CloseListener, Disposable, ErrorListener, Listeners, MessageListener, Transport, TransportError, TransportState};
use crate::codec::LanguageServerCodec;
use crate::jsonrpc::Message;

const OUTBOUND_QUEUE_SIZE: usize = 100;

/// A [`Transport`] driving one already-connected `AsyncRead + AsyncWrite` byte stream.
pub struct IoTransport {
    listeners: Arc<Listeners>,
    outbound: Mutex<mpsc::Sender<Message>>,
    state: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IoTransport {
    /// Spawns the background read/write loop and returns the handle to it.
    fn start<I, O>(read: I, write: O, listeners: Arc<Listeners>, connected: Arc<AtomicBool>) -> (JoinHandle<()>, mpsc::Sender<Message>)
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_SIZE);
        connected.store(true, Ordering::SeqCst);

        let task_listeners = listeners.clone();
        let task_connected = connected.clone();
        let handle = tokio::spawn(async move {
            let mut framed_read = FramedRead::new(read, LanguageServerCodec::default());
            let mut framed_write = FramedWrite::new(write, LanguageServerCodec::default());

            loop {
                tokio::select! {
                    incoming = framed_read.next() => {
                        match incoming {
                            Some(Ok(message)) => task_listeners.notify_message(&message),
                            Some(Err(err)) => {
                                task_listeners.notify_error(&TransportError::wrap("failed to decode message", err));
                            }
                            None => break,
                        }
                    }
                    outgoing = outbound_rx.next() => {
                        match outgoing {
                            Some(message) => {
                                if let Err(err) = framed_write.send(message).await {
                                    task_listeners.notify_error(&TransportError::wrap("failed to encode message", err));
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

        (handle, outbound_tx)
    }

    /// Wraps an already-connected stream in a transport, immediately starting its read/write loop.
    pub fn new<I, O>(read: I, write: O) -> Self
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let listeners = Listeners::new();
        let connected = Arc::new(AtomicBool::new(false));
        let (task, outbound_tx) = IoTransport::start(read, write, listeners.clone(), connected.clone());

        IoTransport {
            listeners,
            outbound: Mutex::new(outbound_tx),
            state: connected,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Convenience constructor matching the `Transport` trait object sessions are built around.
pub fn spawn_io_transport<I, O>(read: I, write: O) -> Arc<dyn Transport>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    Arc::new(IoTransport::new(read, write))
}

#[async_trait]
impl Transport for IoTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let mut outbound = self.outbound.lock().unwrap().clone();
        outbound
            .send(message)
            .await
            .map_err(|_| TransportError::new("transport is closed"))
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
        self.outbound.lock().unwrap().close_channel();
        if let Some(task) = self.task.lock().unwrap().take() {
            if let Err(err) = task.await {
                warn!("transport task panicked: {err}");
            }
        }
    }

    fn state(&self) -> TransportState {
        if self.state.load(Ordering::SeqCst) {
            TransportState::Connected
        } else {
            TransportState::Disconnected
        }
    }
}
