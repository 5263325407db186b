//! Pluggable TLS delegate interface.
//!
//! The core never implements TLS. A delegate performs the handshake on an
//! accepted TCP socket and hands back a wrapped stream plus the ALPN
//! protocol it negotiated; everything after that is ordinary byte I/O.

use crate::stream::Duplex;
use std::{future::Future, io};
use tokio::net::TcpStream;

/// Result of a completed TLS handshake.
pub struct TlsAccepted {
    /// The wrapped socket; reads and writes go through the TLS session.
    pub stream: Box<dyn Duplex>,
    /// Negotiated ALPN protocol name, when the delegate supports ALPN.
    pub alpn: Option<String>,
}

/// Performs TLS handshakes for accepted sockets.
///
/// `accept` runs on a short per-connection task, never on the accept
/// loop, and may block on the peer.
pub trait TlsDelegate: Send + Sync + 'static {
    /// Runs the server-side handshake on `stream`.
    fn accept(&self, stream: TcpStream) -> impl Future<Output = io::Result<TlsAccepted>> + Send;

    /// Advertises `name` in ALPN negotiation. Called once per registered
    /// sub-protocol before the listener starts; the default ignores it.
    fn add_supported_alpn(&self, _name: &str) {}

    /// Whether connections through this delegate count as secure.
    fn is_secure(&self) -> bool {
        true
    }
}

/// The no-TLS placeholder: hands the TCP socket through untouched.
pub struct NoTls;

impl TlsDelegate for NoTls {
    fn accept(&self, stream: TcpStream) -> impl Future<Output = io::Result<TlsAccepted>> + Send {
        async move {
            Ok(TlsAccepted {
                stream: Box::new(stream),
                alpn: None,
            })
        }
    }

    fn is_secure(&self) -> bool {
        false
    }
}
