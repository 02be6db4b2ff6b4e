//! Central inbound-message classification and routing: the piece that decides, for every frame
//! read off a transport, whether it's a response to route to a waiter, a request to hand to a
//! handler, or a notification (including the special-cased `$/cancelRequest` and `exit`).
//!
//! Grounded on the teacher's `transport.rs::Server::serve`, which combined decode, dispatch, and
//! concurrency limiting (via `buffer_unordered`) in one `async fn`; that responsibility is
//! extracted here so it can sit behind any [`crate::transport::Transport`], not just a framed byte
//! stream, and so client and server sessions can share it instead of each reimplementing the match
//! over [`Message`]. Concurrency is bounded the same way in spirit, a fixed-size limit on requests
//! handled at once, implemented here with a semaphore rather than `buffer_unordered` since requests
//! now arrive one at a time from a callback instead of as a single owned stream.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::cancellation::cancellation_pair;
use crate::jsonrpc::{Error, Id, Message, Response};
use crate::middleware::{Chain, Context, Direction, Filter};
use crate::pending::PendingRequests;
use crate::registry::HandlerRegistry;
use crate::transport::{Disposable, Transport, TransportError};

const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Routes inbound messages from a transport to the pending-request tracker (for responses) or the
/// handler registry (for requests and notifications), bounding how many requests may be handled
/// concurrently, and runs every message through the session's middleware chain on its way in or
/// out.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    pending: Arc<PendingRequests>,
    concurrency: Arc<Semaphore>,
    cancel_tokens: DashMap<Id, crate::cancellation::CancellationSource>,
    middleware: Mutex<Chain>,
    label: String,
}

impl Dispatcher {
    /// Builds a dispatcher wired to `transport`, with the default concurrency limit of 4.
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<HandlerRegistry>, pending: Arc<PendingRequests>) -> Arc<Self> {
        Dispatcher::with_concurrency_level(transport, registry, pending, DEFAULT_MAX_CONCURRENCY)
    }

    /// Builds a dispatcher wired to `transport`, handling at most `max` requests concurrently.
    /// Setting `max` to `1` forces sequential processing, implicitly disabling any benefit from
    /// `$/cancelRequest`.
    pub fn with_concurrency_level(
        transport: Arc<dyn Transport>,
        registry: Arc<HandlerRegistry>,
        pending: Arc<PendingRequests>,
        max: usize,
    ) -> Arc<Self> {
        Arc::new(Dispatcher {
            transport,
            registry,
            pending,
            concurrency: Arc::new(Semaphore::new(max.max(1))),
            cancel_tokens: DashMap::new(),
            middleware: Mutex::new(Chain::new()),
            label: "session".to_string(),
        })
    }

    /// Appends a middleware that runs unconditionally on every inbound and outbound message.
    pub fn use_middleware(&self, middleware: Arc<dyn crate::middleware::Middleware>) {
        self.middleware.lock().unwrap().push(middleware);
    }

    /// Appends a middleware scoped to messages matching `filter`.
    pub fn use_middleware_filtered(&self, middleware: Arc<dyn crate::middleware::Middleware>, filter: Filter) {
        self.middleware.lock().unwrap().push_filtered(middleware, filter);
    }

    fn chain(&self) -> Chain {
        self.middleware.lock().unwrap().clone()
    }

    /// Registers this dispatcher's message handler on its transport, and a close listener that
    /// fails every outstanding pending request the moment the transport drops out from under it.
    /// Call once, after construction; the returned disposable detaches both.
    pub fn attach(self: &Arc<Self>) -> Disposable {
        let this = self.clone();
        let message = self.transport.on_message(Box::new(move |message: &Message| {
            let this = this.clone();
            let message = message.clone();
            tokio::spawn(async move { this.handle_inbound(message).await });
        }));

        let this = self.clone();
        let close = self.transport.on_close(Box::new(move || {
            this.fail_all_pending();
        }));

        Disposable::combine(vec![message, close])
    }

    async fn handle_inbound(self: Arc<Self>, message: Message) {
        // `Message::Invalid` carries no method to scope middleware by; route it straight through.
        let ctx = match Context::new(Direction::Inbound, message, self.label.clone()) {
            Ok(ctx) => ctx,
            Err(Message::Invalid { id }) => {
                self.handle_invalid(id);
                return;
            }
            Err(_) => unreachable!("Context::new only rejects Message::Invalid"),
        };

        match self.chain().run(ctx).await {
            Ok(ctx) => self.handle(ctx.message),
            Err(err) => error!("middleware rejected inbound message: {err}"),
        }
    }

    /// Sends `message` to the peer after running it through the outbound side of the middleware
    /// chain, the same path every response, request, and notification this session originates
    /// takes.
    pub async fn send_outbound(&self, message: Message) -> Result<(), TransportError> {
        let ctx = match Context::new(Direction::Outbound, message, self.label.clone()) {
            Ok(ctx) => ctx,
            Err(invalid) => return self.transport.send(invalid).await,
        };

        match self.chain().run(ctx).await {
            Ok(ctx) => self.transport.send(ctx.message).await,
            Err(err) => Err(TransportError::new(format!("middleware rejected outbound message: {err}"))),
        }
    }

    fn handle(self: Arc<Self>, message: Message) {
        match message {
            Message::Response(response) => self.pending.resolve(response),
            Message::Request(request) => {
                let (method, id, params) = request.into_parts();
                match id {
                    Some(id) => self.handle_request(method.into_owned(), id, params),
                    None => self.handle_notification(method.into_owned(), params),
                }
            }
            Message::Invalid { id } => self.handle_invalid(id),
        }
    }

    fn handle_invalid(self: &Arc<Self>, id: Option<Option<Id>>) {
        match id {
            Some(Some(id)) => self.respond(Response::from_error(id, Error::invalid_request())),
            Some(None) => self.respond(Response::from_error(Id::Null, Error::invalid_request())),
            None => {}
        }
    }

    fn handle_notification(self: Arc<Self>, method: String, params: Option<Value>) {
        match method.as_str() {
            "$/cancelRequest" => {
                if let Ok(params) = crate::registry::parse_params::<CancelParams>(params) {
                    if let Some(source) = self.cancel_tokens.get(&params.id) {
                        source.cancel();
                    }
                    self.pending.cancel(&params.id);
                }
                return;
            }
            "exit" => {
                self.cancel_tokens.clear();
            }
            _ => {}
        }

        let Some(future) = self.registry.dispatch_notification(&method, params) else {
            warn!("no handler registered for notification: {method}");
            return;
        };

        tokio::spawn(async move {
            future.await;
        });
    }

    fn handle_request(self: Arc<Self>, method: String, id: Id, params: Option<Value>) {
        let (cancel_source, cancel_token) = cancellation_pair();
        let Some(future) = self.registry.dispatch_request(&method, params, cancel_token) else {
            self.respond(Response::from_error(id, Error::method_not_found()));
            return;
        };
        self.cancel_tokens.insert(id.clone(), cancel_source);

        let this = self.clone();
        let permit_id = id.clone();
        let concurrency = self.concurrency.clone();
        tokio::spawn(async move {
            let _permit = concurrency.acquire_owned().await.expect("semaphore never closed");

            let result = future.await;

            this.cancel_tokens.remove(&permit_id);
            this.respond(Response::from_parts(id, result));
        });
    }

    fn respond(self: &Arc<Self>, response: Response) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.send_outbound(Message::Response(response)).await {
                error!("failed to send response: {err}");
            }
        });
    }

    /// Fails every outstanding outbound request, as if the transport had just closed.
    pub fn fail_all_pending(&self) {
        self.pending.fail_all(|id| Response::from_error(id.clone(), Error::connection_closed()));
    }
}

#[derive(serde::Deserialize)]
struct CancelParams {
    id: Id,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::jsonrpc::Request;
    use crate::transport::{CloseListener, ErrorListener, MessageListener, Listeners, TransportError, TransportState};

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

        fn fire_close(&self) {
            self.listeners.notify_close();
        }
    }

    #[async_trait::async_trait]
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

        async fn close(&self) {
            self.listeners.notify_close();
        }

        fn state(&self) -> TransportState {
            TransportState::Connected
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition did not become true in time");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn routes_request_through_registry_and_responds() {
        let transport = MockTransport::new();
        let registry = Arc::new(HandlerRegistry::new());
        registry.on_request("ping", |_, _| async { Ok(json!("pong")) });

        let dispatcher = Dispatcher::new(transport.clone(), registry, Arc::new(PendingRequests::new()));
        dispatcher.attach();

        let req = Request::from_method("ping", Id::Number(1), Some(json!({})));
        transport.deliver(Message::Request(req));

        wait_until(|| transport.sent.lock().unwrap().len() == 1).await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_method_yields_method_not_found() {
        let transport = MockTransport::new();
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(transport.clone(), registry, Arc::new(PendingRequests::new()));
        dispatcher.attach();

        let req = Request::from_method("missing", Id::Number(1), Some(json!({})));
        transport.deliver(Message::Request(req));
        wait_until(|| !transport.sent.lock().unwrap().is_empty()).await;

        let sent = transport.sent.lock().unwrap();
        match &sent[0] {
            Message::Response(r) => assert!(r.is_error()),
            _ => panic!("expected a response"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn response_routes_to_pending_tracker() {
        let transport = MockTransport::new();
        let registry = Arc::new(HandlerRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let dispatcher = Dispatcher::new(transport.clone(), registry, pending.clone());
        dispatcher.attach();

        let id = pending.next_id();
        let (wait, _token) = pending.wait(id.clone());

        transport.deliver(Message::Response(Response::from_ok(id, json!(42))));
        let response = wait.await;
        assert_eq!(response.result(), Some(&json!(42)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancel_request_mid_flight_interrupts_a_cooperating_handler() {
        let transport = MockTransport::new();
        let registry = Arc::new(HandlerRegistry::new());
        registry.on_request("textDocument/hover", |_, token| async move {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => Ok(json!("hover result")),
                _ = wait_for_cancellation(&token) => Err(Error::request_cancelled()),
            }
        });

        let dispatcher = Dispatcher::new(transport.clone(), registry, Arc::new(PendingRequests::new()));
        dispatcher.attach();

        transport.deliver(Message::Request(Request::from_method(
            "textDocument/hover",
            Id::Number(1),
            Some(json!({})),
        )));
        tokio::task::yield_now().await;

        transport.deliver(Message::Request(Request::notification_for(
            "$/cancelRequest",
            json!({ "id": 1 }),
        )));

        wait_until(|| !transport.sent.lock().unwrap().is_empty()).await;

        match &transport.sent.lock().unwrap()[0] {
            Message::Response(r) => {
                assert!(r.is_error());
                assert_eq!(r.error().unwrap().code, crate::jsonrpc::ErrorCode::RequestCancelled);
            }
            _ => panic!("expected a response"),
        }
    }

    async fn wait_for_cancellation(token: &crate::cancellation::CancellationToken) {
        let (tx, rx) = futures::channel::oneshot::channel::<()>();
        token.on_cancelled(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transport_close_fails_every_pending_request() {
        let transport = MockTransport::new();
        let registry = Arc::new(HandlerRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let dispatcher = Dispatcher::new(transport.clone(), registry, pending.clone());
        dispatcher.attach();

        let id = pending.next_id();
        let (wait, _token) = pending.wait(id);

        transport.fire_close();

        let response = wait.await;
        assert!(response.is_error());
        assert_eq!(response.error().unwrap().code, crate::jsonrpc::ErrorCode::InternalError);
        assert!(pending.is_empty());
    }

    struct RecordingMiddleware(Arc<std::sync::Mutex<Vec<crate::middleware::Direction>>>);

    #[async_trait::async_trait]
    impl crate::middleware::Middleware for RecordingMiddleware {
        async fn handle(
            &self,
            ctx: crate::middleware::Context,
            next: crate::middleware::Next<'_>,
        ) -> Result<crate::middleware::Context, Error> {
            self.0.lock().unwrap().push(ctx.direction);
            next.run(ctx).await
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn middleware_runs_for_both_inbound_requests_and_outbound_responses() {
        let transport = MockTransport::new();
        let registry = Arc::new(HandlerRegistry::new());
        registry.on_request("ping", |_, _| async { Ok(json!("pong")) });

        let dispatcher = Dispatcher::new(transport.clone(), registry, Arc::new(PendingRequests::new()));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        dispatcher.use_middleware(Arc::new(RecordingMiddleware(seen.clone())));
        dispatcher.attach();

        let req = Request::from_method("ping", Id::Number(1), Some(json!({})));
        transport.deliver(Message::Request(req));

        wait_until(|| transport.sent.lock().unwrap().len() == 1).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![crate::middleware::Direction::Inbound, crate::middleware::Direction::Outbound]
        );
    }
}
