//! Client-side session: drives the `initialize`/`initialized`/`shutdown`/`exit` handshake from the
//! calling side and exposes the generic request/notification surface outbound code uses.
//!
//! Grounded on `service/client.rs`'s `Client`/`ClientSocket`. The long tail of concrete LSP
//! convenience methods it used to expose (`show_message`, `configuration`, `workspace_folders`, ...)
//! is dropped; only the generic `send_request`/`send_notification`/initialization-gating primitives
//! survive, generalized to a method name string instead of a fixed `lsp_types::request::*` type
//! parameter. `wait_for_notification` has no teacher precedent; it reuses the `oneshot`-channel idiom
//! [`crate::pending::PendingRequests`] already relies on for its own waiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::channel::oneshot;
use serde_json::Value;

use crate::cancellation::CancellationToken;
use crate::capability::{CapabilityMode, CapabilityState, RegistrationParams, UnregistrationParams};
use crate::dispatcher::Dispatcher;
use crate::jsonrpc::{Error, ErrorCode, Message, Request};
use crate::pending::PendingRequests;
use crate::progress::{PartialResultOutcome, ProgressParams, ProgressTable, ProgressToken};
use crate::registry::{HandlerRegistry, NotificationHandler, Registration, RequestHandler};
use crate::transport::{Disposable, Transport};

use super::{SessionState, StateCell};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Value>,
    filter: Option<Arc<dyn Fn(&Value) -> bool + Send + Sync>>,
}

#[derive(Default)]
struct NotifyState {
    handler: Mutex<Option<Arc<dyn NotificationHandler>>>,
    waiters: Mutex<Vec<Waiter>>,
    next_waiter_id: AtomicU64,
}

/// A disposable handle returned by [`ClientSession::on_notification`].
///
/// Disposing it clears the handler without disturbing any [`ClientSession::wait_for_notification`]
/// waiters registered for the same method, since the two are tracked independently.
pub struct NotificationHandle {
    state: Arc<NotifyState>,
}

impl NotificationHandle {
    /// Clears the handler this handle was returned for.
    pub fn dispose(self) {
        *self.state.handler.lock().unwrap() = None;
    }
}

/// The client half of a JSON-RPC session: issues `initialize`, then drives ordinary request and
/// notification traffic until `disconnect`.
pub struct ClientSession {
    registry: Arc<HandlerRegistry>,
    pending: Arc<PendingRequests>,
    progress: Arc<ProgressTable>,
    state: StateCell,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    attachment: Mutex<Option<Disposable>>,
    server_capabilities: Mutex<Value>,
    capability: Arc<CapabilityState>,
    notify_state: DashMap<String, Arc<NotifyState>>,
}

impl ClientSession {
    /// Creates a session that has not yet connected to a transport, accepting dynamic
    /// registrations from the server regardless of what it declared
    /// ([`CapabilityMode::Compat`]). Use [`Self::with_mode`] for [`CapabilityMode::Strict`].
    pub fn new() -> Arc<Self> {
        Self::with_mode(CapabilityMode::Compat)
    }

    /// Creates a session gating `client/registerCapability` according to `mode`.
    pub fn with_mode(mode: CapabilityMode) -> Arc<Self> {
        let registry = Arc::new(HandlerRegistry::new());
        let progress = Arc::new(ProgressTable::new());
        let capability = Arc::new(CapabilityState::new(Value::Null, mode));

        let progress_for_handler = progress.clone();
        registry.on_notification("$/progress", move |params: Option<Value>| {
            let progress = progress_for_handler.clone();
            async move {
                if let Some(params) = params.and_then(|v| serde_json::from_value::<ProgressParams>(v).ok()) {
                    progress.deliver(&params.token, params.value);
                }
            }
        });

        let capability_for_register = capability.clone();
        registry.on_request(
            "client/registerCapability",
            move |params: Option<Value>, _token| {
                let capability = capability_for_register.clone();
                async move {
                    let params: RegistrationParams =
                        crate::registry::parse_params(params)?;
                    for registration in params.registrations {
                        capability.register(registration)?;
                    }
                    Ok(Value::Null)
                }
            },
        );

        let capability_for_unregister = capability.clone();
        registry.on_request(
            "client/unregisterCapability",
            move |params: Option<Value>, _token| {
                let capability = capability_for_unregister.clone();
                async move {
                    let params: UnregistrationParams =
                        crate::registry::parse_params(params)?;
                    for unregistration in params.unregisterations {
                        capability.unregister(&unregistration.id)?;
                    }
                    Ok(Value::Null)
                }
            },
        );

        Arc::new(ClientSession {
            registry,
            pending: Arc::new(PendingRequests::new()),
            progress,
            state: StateCell::new(),
            dispatcher: Mutex::new(None),
            attachment: Mutex::new(None),
            server_capabilities: Mutex::new(Value::Null),
            capability,
            notify_state: DashMap::new(),
        })
    }

    /// The session's current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// The `capabilities` object the server returned from `initialize`, or `null` before connecting.
    pub fn server_capabilities(&self) -> Value {
        self.server_capabilities.lock().unwrap().clone()
    }

    /// Returns `true` if `path` (dot-separated) is present and truthy within the server's declared
    /// capabilities, or if a method derived from `path` has since been dynamically registered via
    /// `client/registerCapability`.
    pub fn server_declares(&self, path: &str) -> bool {
        self.capability.declares(path) || self.capability.is_registered(&method_of(path))
    }

    /// Attaches `transport`, performs the `initialize`/`initialized` handshake, and transitions to
    /// [`SessionState::Initialized`] on success. On failure, the transport is detached and the
    /// session stays `Created` so a caller may retry with a fresh transport.
    pub async fn connect(&self, transport: Arc<dyn Transport>, params: Value) -> Result<Value, Error> {
        if self.state.get() != SessionState::Created {
            return Err(Error::invalid_request());
        }
        self.state.set(SessionState::Initializing);

        let dispatcher = Dispatcher::new(transport, self.registry.clone(), self.pending.clone());
        let attachment = dispatcher.attach();

        let id = self.pending.next_id();
        let (wait, _token) = self.pending.wait(id.clone());
        let request = Request::from_method("initialize", id, params);
        if let Err(err) = dispatcher.send_outbound(Message::Request(request)).await {
            self.state.set(SessionState::Created);
            attachment.dispose();
            return Err(Error::internal_error_with_message(err.to_string()));
        }

        let (_, body) = wait.await.into_parts();
        let result = match body {
            Ok(result) => result,
            Err(err) => {
                self.state.set(SessionState::Created);
                attachment.dispose();
                return Err(err);
            }
        };

        let capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
        *self.server_capabilities.lock().unwrap() = capabilities.clone();
        self.capability.set_declared(capabilities);
        *self.dispatcher.lock().unwrap() = Some(dispatcher.clone());
        *self.attachment.lock().unwrap() = Some(attachment);
        self.state.set(SessionState::Initialized);

        let notif = Request::notification_for("initialized", Value::Object(Default::default()));
        dispatcher
            .send_outbound(Message::Request(notif))
            .await
            .map_err(|e| Error::internal_error_with_message(e.to_string()))?;

        Ok(result)
    }

    fn dispatcher(&self) -> Result<Arc<Dispatcher>, Error> {
        self.dispatcher
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::internal_error_with_message("client session is not connected"))
    }

    fn fail_fast_if_disconnected(&self) -> Result<(), Error> {
        match self.state.get() {
            SessionState::Shutdown | SessionState::ShuttingDown => Err(Error::invalid_request()),
            _ => Ok(()),
        }
    }

    /// Sends a request to the server, resolving with its result or error.
    ///
    /// If `cancel` fires before a response arrives, `$/cancelRequest` is sent to the peer and the
    /// returned future resolves immediately with [`Error::request_cancelled`] rather than waiting
    /// for the peer's eventual response.
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Value,
        cancel: Option<CancellationToken>,
    ) -> Result<Value, Error> {
        self.fail_fast_if_disconnected()?;
        let dispatcher = self.dispatcher()?;

        let id = self.pending.next_id();
        let (wait, _wait_token) = self.pending.wait(id.clone());
        let request = Request::from_method(method.into(), id.clone(), params);
        dispatcher
            .send_outbound(Message::Request(request))
            .await
            .map_err(|e| Error::internal_error_with_message(e.to_string()))?;

        match cancel {
            Some(cancel) => {
                tokio::select! {
                    response = wait => response.into_parts().1,
                    _ = wait_for_cancellation(&cancel) => {
                        let notif = Request::notification_for(
                            "$/cancelRequest",
                            serde_json::json!({ "id": id }),
                        );
                        let _ = dispatcher.send_outbound(Message::Request(notif)).await;
                        Err(Error::request_cancelled())
                    }
                }
            }
            None => wait.await.into_parts().1,
        }
    }

    /// Sends a request whose response streams partial results via `$/progress` under `token`,
    /// invoking `on_partial` for each one as it arrives and returning the terminal outcome.
    pub async fn send_request_with_partial_results<F>(
        &self,
        method: impl Into<String>,
        params: Value,
        token: ProgressToken,
        on_partial: F,
        cancel: Option<CancellationToken>,
    ) -> PartialResultOutcome<Value>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.progress.subscribe(token.clone(), on_partial);
        match self.send_request(method, params, cancel).await {
            Ok(result) => self.progress.complete(&token, result),
            Err(err) if err.code == ErrorCode::RequestCancelled => match self.progress.cancel(&token) {
                PartialResultOutcome::Cancelled { partials } => PartialResultOutcome::Cancelled { partials },
                _ => unreachable!("ProgressTable::cancel always returns Cancelled"),
            },
            Err(err) => match self.progress.error(&token, err) {
                PartialResultOutcome::Errored { partials, error } => {
                    PartialResultOutcome::Errored { partials, error }
                }
                _ => unreachable!("ProgressTable::error always returns Errored"),
            },
        }
    }

    /// Sends a notification to the server. No response is expected.
    pub async fn send_notification(&self, method: impl Into<String>, params: Value) -> Result<(), Error> {
        self.fail_fast_if_disconnected()?;
        let dispatcher = self.dispatcher()?;
        let notif = Request::notification_for(method.into(), params);
        dispatcher
            .send_outbound(Message::Request(notif))
            .await
            .map_err(|e| Error::internal_error_with_message(e.to_string()))
    }

    /// Registers a handler for a server-to-client request, e.g. `workspace/applyEdit`.
    pub fn on_request<H>(&self, method: impl Into<String>, handler: H) -> Registration
    where
        H: RequestHandler + 'static,
    {
        self.registry.on_request(method, handler)
    }

    /// Registers a handler for a server-to-client notification, e.g. `client/registerCapability`.
    ///
    /// Coexists with any outstanding [`Self::wait_for_notification`] calls for the same method:
    /// both the handler and every matching waiter run for each arrival.
    pub fn on_notification<H>(&self, method: impl Into<String>, handler: H) -> NotificationHandle
    where
        H: NotificationHandler + 'static,
    {
        let method = method.into();
        let state = self.notify_state_for(&method);
        *state.handler.lock().unwrap() = Some(Arc::new(handler));
        NotificationHandle { state }
    }

    /// Waits for the first notification on `method` (optionally matching `filter`) to arrive,
    /// failing with [`Error::request_failed`] if `timeout` elapses first. The waiter is removed on
    /// either outcome; concurrent waiters on the same method are independent of one another.
    pub async fn wait_for_notification(
        &self,
        method: impl Into<String>,
        timeout: Duration,
        filter: Option<Arc<dyn Fn(&Value) -> bool + Send + Sync>>,
    ) -> Result<Value, Error> {
        let method = method.into();
        let state = self.notify_state_for(&method);
        let id = state.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.waiters.lock().unwrap().push(Waiter { id, tx, filter });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::internal_error_with_message("notification waiter channel dropped")),
            Err(_) => {
                state.waiters.lock().unwrap().retain(|w| w.id != id);
                Err(Error::request_failed(format!("timed out waiting for notification {method}")))
            }
        }
    }

    /// Sends `shutdown`, awaits its response, sends `exit`, detaches the transport, and transitions
    /// to [`SessionState::Shutdown`]. Idempotent: calling this again once shut down is a no-op.
    pub async fn disconnect(&self) -> Result<(), Error> {
        if matches!(self.state.get(), SessionState::Shutdown | SessionState::ShuttingDown) {
            return Ok(());
        }
        let dispatcher = self.dispatcher()?;
        self.state.set(SessionState::ShuttingDown);

        let id = self.pending.next_id();
        let (wait, _token) = self.pending.wait(id.clone());
        let request = Request::from_method("shutdown", id, Value::Null);
        dispatcher
            .send_outbound(Message::Request(request))
            .await
            .map_err(|e| Error::internal_error_with_message(e.to_string()))?;
        let (_, body) = wait.await.into_parts();
        body?;

        let notif = Request::notification_for("exit", Value::Null);
        dispatcher
            .send_outbound(Message::Request(notif))
            .await
            .map_err(|e| Error::internal_error_with_message(e.to_string()))?;

        dispatcher.fail_all_pending();
        if let Some(attachment) = self.attachment.lock().unwrap().take() {
            attachment.dispose();
        }
        self.state.set(SessionState::Shutdown);
        Ok(())
    }

    fn notify_state_for(&self, method: &str) -> Arc<NotifyState> {
        if let Some(existing) = self.notify_state.get(method) {
            return existing.clone();
        }

        let state = Arc::new(NotifyState::default());
        self.notify_state.insert(method.to_string(), state.clone());

        let state_for_handler = state.clone();
        self.registry.on_notification(method.to_string(), move |params: Option<Value>| {
            let state = state_for_handler.clone();
            async move {
                let value = params.unwrap_or(Value::Null);

                let mut remaining = Vec::new();
                for waiter in state.waiters.lock().unwrap().drain(..) {
                    let matches = waiter.filter.as_ref().map(|f| f(&value)).unwrap_or(true);
                    if matches {
                        let _ = waiter.tx.send(value.clone());
                    } else {
                        remaining.push(waiter);
                    }
                }
                *state.waiters.lock().unwrap() = remaining;

                let handler = state.handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    handler.call(Some(value)).await;
                }
            }
        });

        state
    }
}

/// Converts a dot-separated capability path (e.g. `"textDocument.hover"`) into the method name a
/// dynamic registration would use for it (`"textDocument/hover"`), mirroring the
/// `dynamicRegistration` leaf's parent segments.
fn method_of(path: &str) -> String {
    path.trim_end_matches(".dynamicRegistration").replace('.', "/")
}

async fn wait_for_cancellation(token: &CancellationToken) {
    if token.is_cancellation_requested() {
        return;
    }
    let (tx, rx) = oneshot::channel::<()>();
    token.on_cancelled(move || {
        let _ = tx.send(());
    });
    let _ = rx.await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::jsonrpc::{Id, Response};
    use crate::transport::{CloseListener, ErrorListener, Listeners, MessageListener, TransportError, TransportState};

    struct MockTransport {
        listeners: Arc<Listeners>,
        sent: Mutex<Vec<Message>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(MockTransport {
                listeners: Listeners::new(),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn deliver(&self, message: Message) {
            self.listeners.notify_message(&message);
        }

        fn last_sent(&self) -> Message {
            self.sent.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, message: Message) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
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

        async fn close(&self) {}

        fn state(&self) -> TransportState {
            TransportState::Connected
        }
    }

    fn request_id_of(message: &Message) -> Id {
        match message {
            Message::Request(r) => r.id().unwrap().clone(),
            _ => panic!("expected a request"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connect_performs_the_initialize_handshake() {
        let transport = MockTransport::new();
        let session = ClientSession::new();

        let connect = tokio::spawn({
            let transport: Arc<dyn Transport> = transport.clone();
            let session = session.clone();
            async move { session.connect(transport, json!({})).await }
        });

        // Allow `connect` to send the `initialize` request before we answer it.
        tokio::task::yield_now().await;
        let id = request_id_of(&transport.last_sent());
        transport.deliver(Message::Response(Response::from_ok(
            id,
            json!({ "capabilities": { "hoverProvider": true } }),
        )));

        let result = connect.await.unwrap().unwrap();
        assert_eq!(result["capabilities"]["hoverProvider"], json!(true));
        assert_eq!(session.state(), SessionState::Initialized);

        match transport.last_sent() {
            Message::Request(r) => assert_eq!(r.method(), "initialized"),
            _ => panic!("expected the initialized notification"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_request_before_connecting_fails() {
        let session = ClientSession::new();
        let err = session.send_request("foo", json!({}), None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn on_notification_dispatches_to_handler() {
        let transport = MockTransport::new();
        let session = ClientSession::new();

        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = seen.clone();
        session.on_notification("window/showMessage", move |_params: Option<Value>| {
            let seen = seen2.clone();
            async move {
                seen.store(true, AtomicOrdering::SeqCst);
            }
        });

        let dispatcher = Dispatcher::new(transport.clone(), session_registry(&session), session_pending(&session));
        dispatcher.attach();
        transport.deliver(Message::Request(Request::notification_for("window/showMessage", json!("hi"))));

        for _ in 0..50 {
            if seen.load(AtomicOrdering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(seen.load(AtomicOrdering::SeqCst));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn wait_for_notification_times_out() {
        let session = ClientSession::new();
        let err = session
            .wait_for_notification("textDocument/publishDiagnostics", Duration::from_millis(20), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestFailed);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn wait_for_notification_resolves_on_matching_arrival() {
        let transport = MockTransport::new();
        let session = ClientSession::new();

        let dispatcher = Dispatcher::new(transport.clone(), session_registry(&session), session_pending(&session));
        dispatcher.attach();

        let waiter = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .wait_for_notification("textDocument/publishDiagnostics", Duration::from_secs(1), None)
                    .await
            }
        });

        tokio::task::yield_now().await;
        transport.deliver(Message::Request(Request::notification_for(
            "textDocument/publishDiagnostics",
            json!({ "uri": "file:///a" }),
        )));

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result["uri"], json!("file:///a"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn register_capability_is_consulted_by_server_declares() {
        let session = ClientSession::new();
        assert!(!session.server_declares("textDocument.rangeFormatting"));

        let registry = session_registry(&session);
        let result = registry
            .dispatch_request(
                "client/registerCapability",
                Some(json!({
                    "registrations": [
                        { "id": "1", "method": "textDocument/rangeFormatting" }
                    ]
                })),
                crate::cancellation::cancellation_pair().1,
            )
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
        assert!(session.server_declares("textDocument.rangeFormatting"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unregister_capability_removes_the_registration() {
        let session = ClientSession::new();
        let registry = session_registry(&session);

        registry
            .dispatch_request(
                "client/registerCapability",
                Some(json!({
                    "registrations": [{ "id": "1", "method": "textDocument/rangeFormatting" }]
                })),
                crate::cancellation::cancellation_pair().1,
            )
            .unwrap()
            .await
            .unwrap();
        assert!(session.server_declares("textDocument.rangeFormatting"));

        registry
            .dispatch_request(
                "client/unregisterCapability",
                Some(json!({
                    "unregisterations": [{ "id": "1", "method": "textDocument/rangeFormatting" }]
                })),
                crate::cancellation::cancellation_pair().1,
            )
            .unwrap()
            .await
            .unwrap();
        assert!(!session.server_declares("textDocument.rangeFormatting"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn strict_mode_rejects_undeclared_registration() {
        let session = ClientSession::with_mode(CapabilityMode::Strict);
        let registry = session_registry(&session);

        let err = registry
            .dispatch_request(
                "client/registerCapability",
                Some(json!({
                    "registrations": [{ "id": "1", "method": "textDocument/rangeFormatting" }]
                })),
                crate::cancellation::cancellation_pair().1,
            )
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
        assert!(!session.server_declares("textDocument.rangeFormatting"));
    }

    // Test-only accessors into private fields, to drive a session's dispatcher directly without
    // going through `connect`, which would also perform the `initialize` handshake.
    fn session_registry(session: &Arc<ClientSession>) -> Arc<HandlerRegistry> {
        session.registry.clone()
    }

    fn session_pending(session: &Arc<ClientSession>) -> Arc<PendingRequests> {
        session.pending.clone()
    }
}
