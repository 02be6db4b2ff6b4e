#![forbid(unsafe_code)]

//! A transport-agnostic JSON-RPC 2.0 runtime for building bidirectional protocol implementations
//! in the shape the Language Server Protocol popularized: a framing codec, a method-name message
//! dispatcher, capability-gated handler registration, `$/progress` streaming, pluggable
//! transports, and client/server session lifecycles. It carries none of the Language Server
//! Protocol's own method catalog, parameter types, or capability keys; callers supply those, the
//! way [`method!`] and [`registry::parse_params`] are written to be driven by any typed
//! params/result a caller supplies rather than a fixed catalog.

/// A re-export of [`async-trait`](https://docs.rs/async-trait) for convenience, used throughout
/// this crate's own object-safe async traits ([`transport::Transport`], [`middleware::Middleware`]).
pub use async_trait::async_trait;

pub mod jsonrpc;

pub mod cancellation;
pub mod capability;
pub mod dispatcher;
#[macro_use]
pub mod method;
pub mod middleware;
pub mod pending;
pub mod progress;
pub mod registry;
pub mod session;
pub mod transport;
pub mod validation;

mod codec;
