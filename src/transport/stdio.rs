//! Transport over the process's standard input and output streams.
//!
//! Direct generalization of the teacher's original `stdio.rs`, minus the `futures`-0.1/`tower`
//! `Service`-specific plumbing that belonged to request dispatch rather than the transport itself.

use std::sync::Arc;

use tokio::io::{Stdin, Stdout};

use super::io::IoTransport;
use super::Transport;

/// Opens a transport over the current process's `stdin`/`stdout`.
///
/// Only one should exist per process; `tokio::io::stdin`/`stdout` each wrap a single shared handle,
/// so constructing a second transport would race the first for bytes.
pub fn stdio() -> Arc<dyn Transport> {
    Arc::new(IoTransport::new(stdin_handle(), stdout_handle()))
}

fn stdin_handle() -> Stdin {
    tokio::io::stdin()
}

fn stdout_handle() -> Stdout {
    tokio::io::stdout()
}
