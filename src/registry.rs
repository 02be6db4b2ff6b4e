//! Method name to handler routing, with disposable registrations and prefix categorization.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::cancellation::CancellationToken;
use crate::jsonrpc::Error;

/// The two classes of inbound traffic a handler may be registered for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerKind {
    /// A request, which always produces exactly one response.
    Request,
    /// A notification, which never produces a response.
    Notification,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// An inbound request handler, invoked with the raw `params` and a [`CancellationToken`] scoped
/// to this one request, returning a JSON result or a protocol-level error. The registry is
/// protocol-agnostic about the payload shape; typed convenience wrappers are layered on top by the
/// [`method!`](crate::method) macro. A handler that wants to honor `$/cancelRequest` subscribes to
/// the token (e.g. racing its own work against `token.on_cancelled`) and returns
/// [`Error::request_cancelled`] once it does; the dispatcher never interrupts a handler on its own.
pub trait RequestHandler: Send + Sync {
    /// Handles one request, producing either a success result or an error to report back.
    fn call(&self, params: Option<Value>, token: CancellationToken) -> BoxFuture<Result<Value, Error>>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Option<Value>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Error>> + Send + 'static,
{
    fn call(&self, params: Option<Value>, token: CancellationToken) -> BoxFuture<Result<Value, Error>> {
        Box::pin(self(params, token))
    }
}

/// An inbound notification handler. Notifications never produce a response; errors are logged by
/// the dispatcher and otherwise swallowed.
pub trait NotificationHandler: Send + Sync {
    /// Handles one notification.
    fn call(&self, params: Option<Value>) -> BoxFuture<()>;
}

impl<F, Fut> NotificationHandler for F
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, params: Option<Value>) -> BoxFuture<()> {
        Box::pin(self(params))
    }
}

enum Entry {
    Request(Arc<dyn RequestHandler>),
    Notification(Arc<dyn NotificationHandler>),
}

impl Entry {
    fn kind(&self) -> HandlerKind {
        match self {
            Entry::Request(_) => HandlerKind::Request,
            Entry::Notification(_) => HandlerKind::Notification,
        }
    }
}

/// Method name to handler map, shared by the client and server sessions.
///
/// Lookup is O(1) by exact method name; registration returns a [`Registration`] handle whose
/// `dispose` removes the entry. Re-registering the same name replaces the previous handler, same
/// as a plain `HashMap::insert`. A method-prefix index (the characters before the first `/`) is
/// maintained for administrative purposes, e.g. capability gating by namespace.
#[derive(Default)]
pub struct HandlerRegistry {
    methods: DashMap<String, Entry>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers a request handler for `method`, replacing any prior registration.
    pub fn on_request<H>(self: &Arc<Self>, method: impl Into<String>, handler: H) -> Registration
    where
        H: RequestHandler + 'static,
    {
        let method = method.into();
        self.methods
            .insert(method.clone(), Entry::Request(Arc::new(handler)));
        Registration {
            registry: self.clone(),
            method,
        }
    }

    /// Registers a notification handler for `method`, replacing any prior registration.
    pub fn on_notification<H>(self: &Arc<Self>, method: impl Into<String>, handler: H) -> Registration
    where
        H: NotificationHandler + 'static,
    {
        let method = method.into();
        self.methods
            .insert(method.clone(), Entry::Notification(Arc::new(handler)));
        Registration {
            registry: self.clone(),
            method,
        }
    }

    /// Returns the kind of handler registered for `method`, if any.
    pub fn kind_of(&self, method: &str) -> Option<HandlerKind> {
        self.methods.get(method).map(|e| e.kind())
    }

    /// Dispatches a request to its registered handler, handing it `token` to observe
    /// `$/cancelRequest` with.
    ///
    /// Returns `None` if no handler is registered for `method`, leaving the caller to respond
    /// with `MethodNotFound`.
    pub fn dispatch_request(
        &self,
        method: &str,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Option<BoxFuture<Result<Value, Error>>> {
        match self.methods.get(method) {
            Some(entry) => match &*entry {
                Entry::Request(handler) => Some(handler.call(params, token)),
                Entry::Notification(_) => None,
            },
            None => None,
        }
    }

    /// Dispatches a notification to its registered handler, if any.
    pub fn dispatch_notification(&self, method: &str, params: Option<Value>) -> Option<BoxFuture<()>> {
        match self.methods.get(method) {
            Some(entry) => match &*entry {
                Entry::Notification(handler) => Some(handler.call(params)),
                Entry::Request(_) => None,
            },
            None => None,
        }
    }

    /// Lists all currently registered method names grouped by their prefix (the characters before
    /// the first `/`, or the whole name if there is no `/`).
    pub fn methods_by_prefix(&self) -> HashMap<String, Vec<String>> {
        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for entry in self.methods.iter() {
            let method = entry.key();
            let prefix = method.split('/').next().unwrap_or(method).to_string();
            grouped.entry(prefix).or_default().push(method.clone());
        }
        grouped
    }

    fn remove(&self, method: &str) {
        self.methods.remove(method);
    }
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_set()
            .entries(self.methods.iter().map(|e| e.key().clone()))
            .finish()
    }
}

/// A disposable handle returned by [`HandlerRegistry::on_request`]/`on_notification`.
///
/// Dropping this handle does *not* remove the registration; call [`Registration::dispose`]
/// explicitly, mirroring the rest of this crate's disposable-handle types (cancellation listeners,
/// transport observers).
pub struct Registration {
    registry: Arc<HandlerRegistry>,
    method: String,
}

impl Registration {
    /// Removes this registration from the registry.
    pub fn dispose(self) {
        self.registry.remove(&self.method);
    }
}

impl Debug for Registration {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Registration")
            .field("method", &self.method)
            .finish()
    }
}

/// Deserializes the `params` value extracted from an inbound [`Request`](crate::jsonrpc::Request)
/// into a typed parameter struct, the way a `method!`-generated request wrapper does.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, Error> {
    match params {
        Some(value) => {
            serde_json::from_value(value).map_err(|e| Error::invalid_params(e.to_string()))
        }
        None => Err(Error::invalid_params("Missing params field")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cancellation::cancellation_pair;

    fn fresh_token() -> CancellationToken {
        cancellation_pair().1
    }

    #[tokio::test(flavor = "current_thread")]
    async fn routes_request_to_registered_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.on_request("ping", |_params, _token| async { Ok(json!("pong")) });

        let result = registry
            .dispatch_request("ping", None, fresh_token())
            .expect("handler registered")
            .await;
        assert_eq!(result, Ok(json!("pong")));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_handler_returns_none() {
        let registry = Arc::new(HandlerRegistry::new());
        assert!(registry.dispatch_request("missing", None, fresh_token()).is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn disposing_registration_removes_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        let reg = registry.on_request("ping", |_, _| async { Ok(Value::Null) });
        reg.dispose();
        assert!(registry.dispatch_request("ping", None, fresh_token()).is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn re_registering_replaces_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.on_request("ping", |_, _| async { Ok(json!(1)) });
        registry.on_request("ping", |_, _| async { Ok(json!(2)) });

        let result = registry.dispatch_request("ping", None, fresh_token()).unwrap().await;
        assert_eq!(result, Ok(json!(2)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_observes_its_cancellation_token() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.on_request("slow", |_, token| async move {
            if token.is_cancellation_requested() {
                Err(Error::request_cancelled())
            } else {
                Ok(json!("done"))
            }
        });

        let (source, token) = cancellation_pair();
        source.cancel();
        let result = registry.dispatch_request("slow", None, token).unwrap().await;
        assert_eq!(result, Err(Error::request_cancelled()));
    }

    #[test]
    fn groups_methods_by_prefix() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.on_request("textDocument/hover", |_, _| async { Ok(Value::Null) });
        registry.on_request("textDocument/definition", |_, _| async { Ok(Value::Null) });
        registry.on_notification("exit", |_| async {});

        let grouped = registry.methods_by_prefix();
        assert_eq!(grouped["textDocument"].len(), 2);
        assert_eq!(grouped["exit"].len(), 1);
    }
}
