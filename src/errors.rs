//! Error types for the codec, parser, and server surfaces.
//!
//! Codec and parser errors stay inside the connection that produced them:
//! a bad HTTP request becomes a single `400` on that socket, a bad FastCGI
//! record closes that socket. Only listener failures surface to the caller.

use std::io;

/// Errors produced while encoding or decoding FastCGI records.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// The buffer does not yet hold a complete record. Read more bytes and
    /// parse again; never fatal.
    #[error("incomplete record, more bytes required")]
    BufferExhausted,

    /// Record carried a protocol version other than 1.
    #[error("unsupported FastCGI protocol version {0}")]
    InvalidVersion(u8),

    /// Record type outside the supported set.
    #[error("invalid record type {0}")]
    InvalidType(u8),

    /// END_REQUEST carried an unknown protocol status.
    #[error("invalid protocol status {0}")]
    InvalidSubType(u8),

    /// BEGIN_REQUEST for a role other than responder.
    #[error("unsupported role {0}")]
    UnsupportedRole(u16),

    /// Records must carry a non-zero request id.
    #[error("request id must be non-zero")]
    InvalidRequestId,

    /// Record content longer than the 16-bit length field allows.
    #[error("record content exceeds 65535 bytes")]
    OversizeData,

    /// A PARAMS pair with a zero-length name.
    #[error("empty parameter name")]
    EmptyParameters,

    /// Record payload shorter than its own framing claims.
    #[error("malformed record payload")]
    Protocol,
}

/// Errors produced by the HTTP request parser.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Malformed request framing. The connection gets one `400` and closes.
    #[error("malformed HTTP request: {0}")]
    Protocol(&'static str),

    /// Peer closed mid-message.
    #[error("connection closed before the message completed")]
    UnexpectedEof,

    /// The parser stalled without consuming input. Treated like a protocol
    /// error by callers.
    #[error("internal parser error")]
    Internal,
}

/// Errors surfaced by [`Server::listen`](crate::Server::listen) and friends.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding or configuring the listening socket failed.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        /// Rendered endpoint, e.g. `tcp://0.0.0.0:8080`.
        endpoint: String,
        /// Underlying socket error.
        source: io::Error,
    },

    /// The server was asked to listen twice or after `stop()`.
    #[error("server is already {state}")]
    InvalidState {
        /// Current lifecycle state name.
        state: &'static str,
    },

    /// Any other I/O failure during startup.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// True for write failures that mean the peer went away; such failures
/// close the handle quietly instead of being reported.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}
