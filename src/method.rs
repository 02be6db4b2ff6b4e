//! Declarative macro generating per-method registration boilerplate.
//!
//! Replaces `tower_lsp_macros`'s `rpc` attribute, which expanded one proc-macro invocation into
//! dispatch arms for an entire method catalog baked in at compile time. That catalog (the mapping
//! from LSP method names to their exact parameter and result types) is out of this crate's scope;
//! what remains worth keeping is the per-method boilerplate the attribute used to generate: a
//! typed marker identifying a method's name, and a `register` function that type-checks a
//! handler's params/result against [`crate::registry::HandlerRegistry`]'s untyped `Value`
//! surface. Expressed here as a `macro_rules!` invoked once per method instead of once per
//! catalog, since this crate carries no compile-time list of methods to expand over.

/// Declares a typed request or notification marker and a `register` function that adapts a
/// strongly typed handler to [`crate::registry::HandlerRegistry`]'s `Option<Value>` surface.
///
/// ```ignore
/// method!(request Hover, "textDocument/hover", HoverParams => Option<Hover>);
/// method!(notification DidOpen, "textDocument/didOpen", DidOpenParams);
///
/// Hover::register(&registry, |params: HoverParams| async move {
///     Ok(None)
/// });
/// ```
#[macro_export]
macro_rules! method {
    (request $name:ident, $method:expr, $params:ty => $result:ty) => {
        #[doc = concat!("Identifies the `", $method, "` request.")]
        pub struct $name;

        impl $name {
            /// This method's JSON-RPC name.
            pub const METHOD: &'static str = $method;

            /// Registers a typed handler for this method on `registry`, deserializing inbound
            /// params as `
            #[doc = stringify!($params)]
            /// ` and serializing the handler's `
            #[doc = stringify!($result)]
            /// ` back into the response.
            pub fn register<F, Fut>(
                registry: &::std::sync::Arc<$crate::registry::HandlerRegistry>,
                handler: F,
            ) -> $crate::registry::Registration
            where
                F: Fn($params) -> Fut + Send + Sync + 'static,
                Fut: ::std::future::Future<Output = Result<$result, $crate::jsonrpc::Error>> + Send + 'static,
            {
                let handler = ::std::sync::Arc::new(handler);
                registry.on_request(Self::METHOD, move |raw: Option<::serde_json::Value>, _token: $crate::cancellation::CancellationToken| {
                    let handler = handler.clone();
                    async move {
                        let params = $crate::registry::parse_params::<$params>(raw)?;
                        let result = handler(params).await?;
                        ::serde_json::to_value(result).map_err(|e| {
                            $crate::jsonrpc::Error::internal_error_with_message(e.to_string())
                        })
                    }
                })
            }
        }
    };

    (notification $name:ident, $method:expr, $params:ty) => {
        #[doc = concat!("Identifies the `", $method, "` notification.")]
        pub struct $name;

        impl $name {
            /// This method's JSON-RPC name.
            pub const METHOD: &'static str = $method;

            /// Registers a typed handler for this method on `registry`. A params value that
            /// fails to deserialize as `
            #[doc = stringify!($params)]
            /// ` is logged and otherwise swallowed, since notifications never produce a response.
            pub fn register<F, Fut>(
                registry: &::std::sync::Arc<$crate::registry::HandlerRegistry>,
                handler: F,
            ) -> $crate::registry::Registration
            where
                F: Fn($params) -> Fut + Send + Sync + 'static,
                Fut: ::std::future::Future<Output = ()> + Send + 'static,
            {
                let handler = ::std::sync::Arc::new(handler);
                let method = Self::METHOD;
                registry.on_notification(method, move |raw: Option<::serde_json::Value>| {
                    let handler = handler.clone();
                    async move {
                        match $crate::registry::parse_params::<$params>(raw) {
                            Ok(params) => handler(params).await,
                            Err(err) => ::tracing::warn!("failed to parse params for {method}: {err}"),
                        }
                    }
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use crate::registry::HandlerRegistry;

    #[derive(Deserialize)]
    struct PingParams {
        n: i64,
    }

    #[derive(Serialize)]
    struct PongResult {
        n: i64,
    }

    method!(request Ping, "ping", PingParams => PongResult);

    #[derive(Deserialize)]
    struct LogParams {
        message: String,
    }

    method!(notification Log, "log", LogParams);

    #[tokio::test(flavor = "current_thread")]
    async fn request_marker_round_trips_typed_params_and_result() {
        let registry = Arc::new(HandlerRegistry::new());
        Ping::register(&registry, |params: PingParams| async move {
            Ok(PongResult { n: params.n + 1 })
        });

        let result = registry
            .dispatch_request(
                Ping::METHOD,
                Some(json!({ "n": 41 })),
                crate::cancellation::cancellation_pair().1,
            )
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result, json!({ "n": 42 }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn notification_marker_invokes_typed_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        Log::register(&registry, move |params: LogParams| {
            let seen = seen_clone.clone();
            async move {
                assert_eq!(params.message, "hello");
                seen.store(true, Ordering::SeqCst);
            }
        });

        registry
            .dispatch_notification(Log::METHOD, Some(json!({ "message": "hello" })))
            .unwrap()
            .await;
        assert!(seen.load(Ordering::SeqCst));
    }
}
