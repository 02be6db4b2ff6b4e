//! Transport over a generic inter-process channel: anything implementing `AsyncRead`/`AsyncWrite`,
//! such as a Unix domain socket or Windows named pipe.
//!
//! No dedicated IPC crate is introduced; Unix sockets and named pipes already implement
//! `tokio::io::{AsyncRead, AsyncWrite}` directly, the same interface `stdio` and `tcp` are built
//! on, so this module is a thin constructor rather than its own protocol implementation.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use super::io::IoTransport;
use super::Transport;

/// Wraps an already-connected duplex channel (a Unix socket, a named pipe, or any other stream
/// implementing `AsyncRead + AsyncWrite`) as a transport.
pub fn connect<S>(stream: S) -> Arc<dyn Transport>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    Arc::new(IoTransport::new(read, write))
}

#[cfg(all(test, unix))]
mod tests {
    use tokio::net::UnixStream;

    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn wraps_a_connected_unix_socket_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let transport_a = connect(a);
        let _transport_b = connect(b);
        assert!(transport_a.is_connected());
    }
}
