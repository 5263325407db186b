//! Byte-stream abstraction shared by plain TCP, Unix-domain, and
//! TLS-wrapped sockets.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything the connection drive loop can read from and write to.
///
/// Implemented automatically for every async duplex stream, including
/// `TcpStream`, `UnixStream`, and whatever a TLS delegate hands back.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}
