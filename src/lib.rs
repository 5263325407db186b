//! harbor_net - HTTP/1.1 and FastCGI transport core
//!
//! The plumbing layer of a web service: it owns accepted sockets, frames
//! inbound bytes into requests, hands them to your delegate, and streams
//! well-formed responses back, without dictating anything about routing
//! or application structure.
//!
//! # What it does
//!
//! - **HTTP/1.1** with persistent connections: incremental request
//!   parsing (including chunked bodies), in-order pipelining, configurable
//!   keep-alive limits, and protocol upgrades (`101 Switching Protocols`).
//! - **FastCGI responder role** over the same socket machinery:
//!   record codec, parameter mapping to ordinary requests, multiplex
//!   rejection on the wire.
//! - **Socket management**: one task per connection, idle eviction,
//!   connection-count admission with automatic `503` responses.
//! - **TLS as a plug**: a [`TlsDelegate`] performs the handshake and
//!   ALPN; the core never links a TLS stack.
//! - **Lifecycle hooks**: started/stopped/failed callbacks and a global
//!   request monitor.
//!
//! # Quick Start
//!
//! ```no_run
//! use harbor_net::{Endpoint, Server, ServerDelegate, ServerRequest, ServerResponse};
//! use std::io;
//!
//! struct Hello;
//!
//! impl ServerDelegate for Hello {
//!     async fn handle(
//!         &self,
//!         _request: &mut ServerRequest,
//!         response: &mut ServerResponse<'_>,
//!     ) -> io::Result<()> {
//!         response.headers_mut().append("Content-Type", "text/plain");
//!         response.end_with("Hello world!").await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::builder()
//!         .endpoint(Endpoint::tcp(8080))
//!         .delegate(Hello)
//!         .build();
//!     server.listen().await.unwrap();
//!     std::future::pending::<()>().await;
//! }
//! ```
//!
//! Serving FastCGI behind a front-end web server is the same delegate
//! with `.protocol(Protocol::FastCgi)` on the builder.
pub(crate) mod http {
    pub(crate) mod parser;
    pub(crate) mod processor;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod fastcgi {
    pub(crate) mod processor;
    pub(crate) mod record;
    pub(crate) mod response;
}
pub(crate) mod server {
    pub(crate) mod handler;
    pub(crate) mod listener;
    pub(crate) mod manager;
    pub(crate) mod server_impl;
}
pub(crate) mod buffer;
pub(crate) mod config;
pub(crate) mod errors;
pub(crate) mod lifecycle;
pub(crate) mod stream;
pub(crate) mod tls;
pub(crate) mod upgrade;

pub use crate::{
    buffer::BufferList,
    config::{ConnectionPolicy, Endpoint, KeepAlive, Protocol, ServerConfig},
    errors::{ParseError, RecordError, ServerError},
    fastcgi::record::{ProtocolStatus, Record, RecordType, Role},
    http::{
        request::ServerRequest,
        types::{reason_phrase, Headers, Version},
    },
    lifecycle::{set_monitor, ServerMonitor},
    server::server_impl::{Server, ServerBuilder, ServerDelegate, ServerResponse},
    stream::Duplex,
    tls::{NoTls, TlsAccepted, TlsDelegate},
    upgrade::{upgrade_registry, ConnectionUpgradeFactory, UpgradeProcessor, UpgradeRegistry},
};
