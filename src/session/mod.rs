//! Client and server session state machines built on top of the [`crate::dispatcher::Dispatcher`].
//!
//! No single teacher file covers this: `tower_lsp::service` hardcoded the server side around
//! `lsp_types::request::Initialize` and friends, while `tower_lsp::client::Client` hardcoded the
//! client side around a fixed catalog of outbound LSP methods. Both are generalized here to a
//! method-name string plus a `serde_json::Value` payload, sharing one five-state lifecycle instead
//! of the teacher's two separate state representations (`AtomicBool` on the client,
//! `service::state::State` on the server).

pub mod client;
pub mod server;

use std::sync::Mutex;

/// The lifecycle states a session moves through from construction to teardown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// The session has been constructed but `initialize` has not yet been sent or received.
    Created,
    /// `initialize` is in flight.
    Initializing,
    /// `initialize` completed successfully; normal traffic may flow.
    Initialized,
    /// `shutdown` has been accepted; only `exit` should follow.
    ShuttingDown,
    /// `exit` has been processed, or the transport closed. Terminal.
    Shutdown,
}

pub(crate) struct StateCell(Mutex<SessionState>);

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell(Mutex::new(SessionState::Created))
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.0.lock().unwrap()
    }

    pub(crate) fn set(&self, state: SessionState) {
        *self.0.lock().unwrap() = state;
    }
}
