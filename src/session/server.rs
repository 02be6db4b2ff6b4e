//! Server-side session: answers the inbound `initialize`/`initialized` handshake, gates handler
//! registration by the capabilities the server has declared, and drives `shutdown`/`exit`.
//!
//! Grounded on `src/service.rs` and `src/service/layers.rs`'s state-machine gating (`State::Created`
//! refusing traffic before `initialize`, `exit` refusing traffic after `shutdown`), generalized the
//! same way [`super::client::ClientSession`] generalizes `service/client.rs`: a method-name string
//! plus a `serde_json::Value` payload instead of a fixed `lsp_types::request::*` type parameter. The
//! capability-gated `on_request`/`on_notification` has no teacher precedent — the teacher baked
//! capability checks into generated per-method dispatch via `tower_lsp_macros`; here it is expressed
//! as an explicit, caller-supplied capability path consulted against [`CapabilityState::declares`],
//! since the LSP method-to-capability-key catalog itself is out of this crate's scope.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

use crate::capability::{CapabilityMode, CapabilityState};
use crate::dispatcher::Dispatcher;
use crate::jsonrpc::{Error, Message, Request};
use crate::pending::PendingRequests;
use crate::registry::{HandlerRegistry, NotificationHandler, Registration, RequestHandler};
use crate::transport::{Disposable, Transport};
use crate::validation::ValidationTable;

use super::{SessionState, StateCell};

/// Methods that bypass capability gating entirely: the handshake itself, its teardown
/// counterparts, and the text-document synchronization notifications every server needs
/// regardless of which features it advertises.
const ALWAYS_REGISTRABLE: &[&str] = &[
    "initialize",
    "initialized",
    "shutdown",
    "exit",
    "textDocument/didOpen",
    "textDocument/didChange",
    "textDocument/didClose",
    "textDocument/didSave",
];

/// The server half of a JSON-RPC session: answers `initialize`, gates feature registration by
/// declared capabilities, and drives `shutdown`/`exit` to completion.
pub struct ServerSession {
    registry: Arc<HandlerRegistry>,
    pending: Arc<PendingRequests>,
    state: StateCell,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    attachment: Mutex<Option<Disposable>>,
    capabilities: Mutex<Value>,
    mode: CapabilityMode,
    validation: Arc<ValidationTable>,
}

impl ServerSession {
    /// Creates a session with no declared capabilities, gating registration in
    /// [`CapabilityMode::Strict`]. Use [`Self::with_mode`] for [`CapabilityMode::Compat`].
    pub fn new() -> Arc<Self> {
        Self::with_mode(CapabilityMode::Strict)
    }

    /// Creates a session gating registration according to `mode`.
    pub fn with_mode(mode: CapabilityMode) -> Arc<Self> {
        let session = Arc::new(ServerSession {
            registry: Arc::new(HandlerRegistry::new()),
            pending: Arc::new(PendingRequests::new()),
            state: StateCell::new(),
            dispatcher: Mutex::new(None),
            attachment: Mutex::new(None),
            capabilities: Mutex::new(Value::Object(Default::default())),
            mode,
            validation: Arc::new(ValidationTable::new()),
        });
        session.register_lifecycle_handlers();
        session
    }

    fn register_lifecycle_handlers(self: &Arc<Self>) {
        let this = self.clone();
        self.registry.on_request("shutdown", move |_params: Option<Value>, _token| {
            let this = this.clone();
            async move {
                this.state.set(SessionState::ShuttingDown);
                Ok(Value::Null)
            }
        });

        let this = self.clone();
        self.registry.on_notification("exit", move |_params: Option<Value>| {
            let this = this.clone();
            async move {
                this.state.set(SessionState::Shutdown);
                if let Some(dispatcher) = this.dispatcher.lock().unwrap().clone() {
                    dispatcher.fail_all_pending();
                }
                if let Some(attachment) = this.attachment.lock().unwrap().take() {
                    attachment.dispose();
                }
            }
        });
    }

    /// The session's current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// The capabilities object this server currently declares.
    pub fn capabilities(&self) -> Value {
        self.capabilities.lock().unwrap().clone()
    }

    /// Replaces the declared capabilities object wholesale.
    pub fn set_capabilities(&self, caps: Value) {
        *self.capabilities.lock().unwrap() = caps;
    }

    /// Merges `value` into the declared capabilities at `path` (dot-separated, creating
    /// intermediate objects as needed), returning `self` so calls may be chained, mirroring the
    /// teacher's `LspServiceBuilder` chaining style.
    pub fn register_capability(self: &Arc<Self>, path: &str, value: Value) -> Arc<Self> {
        let mut caps = self.capabilities.lock().unwrap();
        set_path(&mut caps, path, value);
        drop(caps);
        self.clone()
    }

    fn declares(&self, path: &str) -> bool {
        CapabilityState::new(self.capabilities(), self.mode).declares(path)
    }

    fn check_capability_gate(&self, method: &str, capability: Option<&str>) -> Result<(), Error> {
        if ALWAYS_REGISTRABLE.contains(&method) {
            return Ok(());
        }
        let Some(path) = capability else {
            return Ok(());
        };
        if self.declares(path) {
            return Ok(());
        }
        match self.mode {
            CapabilityMode::Strict => Err(Error::invalid_params(format!(
                "cannot register {method}: capability {path} was not declared"
            ))),
            CapabilityMode::Compat => {
                warn!("registering {method} for undeclared capability {path}");
                Ok(())
            }
        }
    }

    /// The table governing structural validation of inbound `params`, applied ahead of dispatch to
    /// any method a schema has been registered for via [`ValidationTable::set_schema`].
    pub fn validation(&self) -> &ValidationTable {
        &self.validation
    }

    /// Registers a request handler for `method`, gated by `capability` (a dot path into the
    /// declared capabilities object), unless `method` is always registrable (the lifecycle
    /// methods and text-document synchronization notifications). Pass `None` for a method this
    /// crate's caller considers always-on.
    ///
    /// If a schema was registered for `method` via [`Self::validation`], inbound `params` are
    /// checked against it before `handler` runs; a mismatch is reported back as `InvalidParams`
    /// without invoking `handler` at all.
    pub fn on_request<H>(
        &self,
        method: impl Into<String>,
        capability: Option<&str>,
        handler: H,
    ) -> Result<Registration, Error>
    where
        H: RequestHandler + 'static,
    {
        let method = method.into();
        self.check_capability_gate(&method, capability)?;

        let validation = self.validation.clone();
        let validated_method = method.clone();
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        Ok(self.registry.on_request(method, move |params: Option<Value>, token| {
            let validation = validation.clone();
            let validated_method = validated_method.clone();
            let handler = handler.clone();
            async move {
                validation.validate(&validated_method, &params)?;
                handler.call(params, token).await
            }
        }))
    }

    /// Registers a notification handler for `method`, gated the same way as [`Self::on_request`].
    ///
    /// A `params` mismatch against a schema registered via [`Self::validation`] is logged and the
    /// notification is dropped without invoking `handler`, consistent with notifications never
    /// producing a response to report the error on.
    pub fn on_notification<H>(
        &self,
        method: impl Into<String>,
        capability: Option<&str>,
        handler: H,
    ) -> Result<Registration, Error>
    where
        H: NotificationHandler + 'static,
    {
        let method = method.into();
        self.check_capability_gate(&method, capability)?;

        let validation = self.validation.clone();
        let validated_method = method.clone();
        let handler: Arc<dyn NotificationHandler> = Arc::new(handler);
        Ok(self.registry.on_notification(method, move |params: Option<Value>| {
            let validation = validation.clone();
            let validated_method = validated_method.clone();
            let handler = handler.clone();
            async move {
                if let Err(err) = validation.validate(&validated_method, &params) {
                    warn!("dropping invalid {validated_method} notification: {}", err.message);
                    return;
                }
                handler.call(params).await
            }
        }))
    }

    /// Attaches `transport`, waits for the client's `initialize` request (replying with the
    /// declared capabilities) followed by its `initialized` notification, and transitions to
    /// [`SessionState::Initialized`]. Returns the client's `initialize` params.
    pub async fn listen(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<Value, Error> {
        if self.state.get() != SessionState::Created {
            return Err(Error::invalid_request());
        }
        self.state.set(SessionState::Initializing);

        let (init_tx, init_rx) = futures::channel::oneshot::channel::<Value>();
        let init_tx = Arc::new(Mutex::new(Some(init_tx)));

        let this = self.clone();
        self.registry.on_request("initialize", move |params: Option<Value>, _token| {
            let this = this.clone();
            let init_tx = init_tx.clone();
            async move {
                if let Some(tx) = init_tx.lock().unwrap().take() {
                    let _ = tx.send(params.unwrap_or(Value::Null));
                } else {
                    return Err(Error::invalid_request());
                }
                Ok(serde_json::json!({ "capabilities": this.capabilities() }))
            }
        });

        let (initialized_tx, initialized_rx) = futures::channel::oneshot::channel::<()>();
        let initialized_tx = Arc::new(Mutex::new(Some(initialized_tx)));
        self.registry.on_notification("initialized", move |_params: Option<Value>| {
            let initialized_tx = initialized_tx.clone();
            async move {
                if let Some(tx) = initialized_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        });

        let dispatcher = Dispatcher::new(transport, self.registry.clone(), self.pending.clone());
        let attachment = dispatcher.attach();

        let params = init_rx.await.map_err(|_| {
            Error::internal_error_with_message("transport closed before initialize arrived")
        })?;
        initialized_rx.await.map_err(|_| {
            Error::internal_error_with_message("transport closed before initialized arrived")
        })?;

        *self.dispatcher.lock().unwrap() = Some(dispatcher);
        *self.attachment.lock().unwrap() = Some(attachment);
        self.state.set(SessionState::Initialized);
        Ok(params)
    }

    fn dispatcher(&self) -> Result<Arc<Dispatcher>, Error> {
        self.dispatcher
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::internal_error_with_message("server session is not listening"))
    }

    /// Sends a request to the client.
    pub async fn send_request(&self, method: impl Into<String>, params: Value) -> Result<Value, Error> {
        let dispatcher = self.dispatcher()?;
        let id = self.pending.next_id();
        let (wait, _token) = self.pending.wait(id.clone());
        let request = Request::from_method(method.into(), id, params);
        dispatcher
            .send_outbound(Message::Request(request))
            .await
            .map_err(|e| Error::internal_error_with_message(e.to_string()))?;
        wait.await.into_parts().1
    }

    /// Sends a notification to the client. No response is expected.
    pub async fn send_notification(&self, method: impl Into<String>, params: Value) -> Result<(), Error> {
        let dispatcher = self.dispatcher()?;
        let notif = Request::notification_for(method.into(), params);
        dispatcher
            .send_outbound(Message::Request(notif))
            .await
            .map_err(|e| Error::internal_error_with_message(e.to_string()))
    }

    /// Transitions through `shuttingDown` to `shutdown` and detaches the transport. Idempotent.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if matches!(self.state.get(), SessionState::Shutdown) {
            return Ok(());
        }
        self.state.set(SessionState::ShuttingDown);
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().clone() {
            dispatcher.fail_all_pending();
        }
        if let Some(attachment) = self.attachment.lock().unwrap().take() {
            attachment.dispose();
        }
        self.state.set(SessionState::Shutdown);
        Ok(())
    }
}

fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = target;
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        let map = current.as_object_mut().expect("just normalized to an object");
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map.entry(segment.to_string()).or_insert_with(|| Value::Object(Default::default()));
    }
}
