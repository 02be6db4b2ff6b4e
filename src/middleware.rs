//! Pluggable middleware chain applied to inbound and outbound messages.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;

use crate::jsonrpc::{Error, Message};

/// The direction a message is travelling relative to the local session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// A message arriving from the peer.
    Inbound,
    /// A message about to be sent to the peer.
    Outbound,
}

/// The JSON-RPC message class, mirroring [`Message`]'s variants without borrowing from them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageType {
    /// A request expecting a response.
    Request,
    /// A response to a previously issued request.
    Response,
    /// A notification.
    Notification,
}

/// Arbitrary side-channel data middleware can use to pass information to later stages, e.g. timing
/// or tracing spans. Stored as loosely typed JSON for simplicity, matching the rest of this
/// crate's preference for `serde_json::Value` at component boundaries it doesn't otherwise own.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// The context passed through one middleware invocation.
pub struct Context {
    /// Which way the message is travelling.
    pub direction: Direction,
    /// The message's JSON-RPC class.
    pub message_type: MessageType,
    /// The method name, if this message carries one (requests and notifications; `None` for
    /// responses).
    pub method: Option<String>,
    /// The message itself. Middleware may replace it in place via [`Context::message`].
    pub message: Message,
    /// Side-channel data threaded through the chain.
    pub metadata: Metadata,
    /// A label identifying which transport this message travelled or will travel over, useful for
    /// sessions multiplexing several peers (e.g. a shared-worker hub).
    pub transport: String,
}

impl Context {
    fn request_id(&self) -> Option<&crate::jsonrpc::Id> {
        match &self.message {
            Message::Request(r) => r.id(),
            Message::Response(r) => Some(r.id()),
            Message::Invalid { .. } => None,
        }
    }

    /// Builds a context wrapping `message`, inferring its [`MessageType`] and method name.
    ///
    /// Returns `message` back unwrapped for [`Message::Invalid`], which carries no method and is
    /// not meaningful to run through a method/type-scoped middleware chain; callers should handle
    /// that case separately instead of running it through the chain.
    pub fn new(direction: Direction, message: Message, transport: impl Into<String>) -> Result<Self, Message> {
        let (message_type, method) = match &message {
            Message::Request(r) if r.id().is_some() => (MessageType::Request, Some(r.method().to_string())),
            Message::Request(r) => (MessageType::Notification, Some(r.method().to_string())),
            Message::Response(_) => (MessageType::Response, None),
            Message::Invalid { .. } => return Err(message),
        };

        Ok(Context {
            direction,
            message_type,
            method,
            message,
            metadata: Metadata::new(),
            transport: transport.into(),
        })
    }
}

/// The remainder of the middleware chain, invoked by a middleware to continue processing.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    /// Invokes the next middleware in the chain, or returns the context unchanged if this was the
    /// last one.
    pub async fn run(self, ctx: Context) -> Result<Context, Error> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(ctx, Next { chain: rest }).await,
            None => Ok(ctx),
        }
    }
}

/// One stage in the middleware pipeline.
///
/// Grounded on `tower::Layer`/`tower::Service` composition, the teacher's mechanism for wrapping
/// request handling (see `service.rs`'s `LspService` builder chaining `.layer(...)` calls); that
/// composition is compile-time and per-service-type, whereas this crate needs a runtime list the
/// caller can grow after construction, so it is expressed as a boxed trait object chain instead of
/// stacked generic `Layer`s, the way `async-trait` lets this crate express run-time polymorphic
/// async interfaces elsewhere (`RequestHandler`, `NotificationHandler`).
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Processes `ctx`, then calls `next.run(ctx)` to continue the chain, or returns early to
    /// short-circuit it.
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<Context, Error>;
}

/// An ordered chain of middleware, optionally scoped to a subset of messages.
///
/// Cheaply cloneable: every entry only holds an `Arc<dyn Middleware>` and a `Filter`, so a session
/// can snapshot the chain out of a lock before running it without holding that lock across an
/// `await`.
#[derive(Clone, Default)]
pub struct Chain {
    entries: Vec<Entry>,
}

#[derive(Clone)]
struct Entry {
    middleware: Arc<dyn Middleware>,
    filter: Filter,
}

/// Restricts a middleware entry to a subset of directions, message types, or methods. `None` in any
/// field means "no restriction on this axis".
#[derive(Clone, Default)]
pub struct Filter {
    /// Restrict to this direction, if set.
    pub direction: Option<Direction>,
    /// Restrict to this message type, if set.
    pub message_type: Option<MessageType>,
    /// Restrict to messages whose method matches exactly, if set.
    pub method: Option<String>,
}

impl Filter {
    fn matches(&self, ctx: &Context) -> bool {
        if let Some(direction) = self.direction {
            if direction != ctx.direction {
                return false;
            }
        }
        if let Some(message_type) = self.message_type {
            if message_type != ctx.message_type {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if ctx.method.as_deref() != Some(method.as_str()) {
                return false;
            }
        }
        true
    }
}

impl Chain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Chain::default()
    }

    /// Appends a middleware that runs unconditionally on every message.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.push_filtered(middleware, Filter::default());
    }

    /// Appends a middleware scoped to messages matching `filter`.
    pub fn push_filtered(&mut self, middleware: Arc<dyn Middleware>, filter: Filter) {
        self.entries.push(Entry { middleware, filter });
    }

    /// Runs `ctx` through every middleware whose filter matches it, in registration order.
    ///
    /// The request id (for requests and responses) must be unchanged between the context passed in
    /// and the context returned. A middleware that mutates it is a programming error, and the
    /// pipeline fails with an internal error rather than forwarding the tampered context.
    pub async fn run(&self, ctx: Context) -> Result<Context, Error> {
        let applicable: Vec<Arc<dyn Middleware>> = self
            .entries
            .iter()
            .filter(|e| e.filter.matches(&ctx))
            .map(|e| e.middleware.clone())
            .collect();

        let original_id = ctx.request_id().cloned();
        let next = Next { chain: &applicable };
        let result = next.run(ctx).await;

        match result {
            Ok(ctx) if ctx.request_id().cloned() != original_id => {
                Err(Error::internal_error_with_message(
                    "middleware changed a message's request id",
                ))
            }
            other => other,
        }
    }
}

impl Debug for Chain {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Chain").field("len", &self.entries.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::jsonrpc::{Id, Request};

    struct Recorder(std::sync::Arc<std::sync::Mutex<Vec<&'static str>>>, &'static str);

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<Context, Error> {
            self.0.lock().unwrap().push(self.1);
            next.run(ctx).await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(&self, ctx: Context, _next: Next<'_>) -> Result<Context, Error> {
            Ok(ctx)
        }
    }

    fn request_ctx(method: &str) -> Context {
        Context {
            direction: Direction::Inbound,
            message_type: MessageType::Request,
            method: Some(method.to_string()),
            message: Message::Request(Request::from_method(method, Id::Number(1), Some(json!({})))),
            metadata: Metadata::new(),
            transport: "test".into(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn runs_middleware_in_registration_order() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.push(Arc::new(Recorder(log.clone(), "first")));
        chain.push(Arc::new(Recorder(log.clone(), "second")));

        chain.run(request_ctx("foo")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn short_circuit_skips_remaining_middleware() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.push(Arc::new(ShortCircuit));
        chain.push(Arc::new(Recorder(log.clone(), "never")));

        chain.run(request_ctx("foo")).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn method_filter_skips_non_matching_messages() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.push_filtered(
            Arc::new(Recorder(log.clone(), "hover-only")),
            Filter {
                method: Some("textDocument/hover".into()),
                ..Default::default()
            },
        );

        chain.run(request_ctx("textDocument/definition")).await.unwrap();
        assert!(log.lock().unwrap().is_empty());

        chain.run(request_ctx("textDocument/hover")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["hover-only"]);
    }

    struct IdMutator;

    #[async_trait]
    impl Middleware for IdMutator {
        async fn handle(&self, mut ctx: Context, next: Next<'_>) -> Result<Context, Error> {
            if let Message::Request(req) = &mut ctx.message {
                *req = Request::from_method(
                    req.method().to_string(),
                    Id::Number(999),
                    req.params().cloned(),
                );
            }
            next.run(ctx).await
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mutating_the_request_id_fails_the_pipeline() {
        let mut chain = Chain::new();
        chain.push(Arc::new(IdMutator));

        let err = chain.run(request_ctx("foo")).await.unwrap_err();
        assert_eq!(err.code, crate::jsonrpc::ErrorCode::InternalError);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn direction_filter_restricts_to_one_direction() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.push_filtered(
            Arc::new(Recorder(log.clone(), "outbound-only")),
            Filter {
                direction: Some(Direction::Outbound),
                ..Default::default()
            },
        );

        chain.run(request_ctx("foo")).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }
}
