//! Server configuration: endpoints, keep-alive policy, admission limits.
//!
//! Configuration is assembled once through the [`ServerBuilder`
//! ](crate::ServerBuilder) and is immutable after `listen()` begins.

use std::{path::PathBuf, time::Duration};

/// Interval between idle-connection sweeps, and the `timeout=` value
/// advertised in `Keep-Alive` response headers.
pub(crate) const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Where the server listens.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// A TCP endpoint. Port `0` requests an ephemeral port; the bound port
    /// is discoverable through [`Server::port`](crate::Server::port).
    Tcp {
        /// Port to bind; `0` for ephemeral.
        port: u16,
        /// Bind address; `None` binds all interfaces.
        address: Option<String>,
        /// Sets `SO_REUSEPORT` so several processes can share the port.
        allow_port_reuse: bool,
    },
    /// A Unix-domain socket at an absolute path.
    Unix {
        /// Filesystem path of the socket.
        path: PathBuf,
    },
}

impl Endpoint {
    /// TCP endpoint on all interfaces without port reuse.
    pub fn tcp(port: u16) -> Self {
        Endpoint::Tcp {
            port,
            address: None,
            allow_port_reuse: false,
        }
    }

    /// Unix-domain endpoint at `path`.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix { path: path.into() }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Endpoint::Tcp { port, address, .. } => format!(
                "tcp://{}:{port}",
                address.as_deref().unwrap_or("0.0.0.0")
            ),
            Endpoint::Unix { path } => format!("unix://{}", path.display()),
        }
    }
}

/// How many requests one connection may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// Every response closes the connection.
    Disabled,
    /// Connections are reused until the peer closes or the idle sweep
    /// evicts them.
    Unlimited,
    /// At most `n` requests per connection; the `n`-th response carries
    /// `Connection: Close`.
    Limited(u32),
}

impl Default for KeepAlive {
    fn default() -> Self {
        KeepAlive::Unlimited
    }
}

/// Admission policy for new connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionPolicy {
    /// Maximum concurrent connections; `None` for no limit. When the limit
    /// is reached an eager idle sweep runs, and if the count still holds
    /// the new socket is answered with a `503` and closed.
    pub max_connections: Option<usize>,
}

/// Which protocol accepted sockets speak by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// HTTP/1.1 with keep-alive (the ALPN name `http/1.1`).
    #[default]
    Http,
    /// FastCGI responder role.
    FastCgi,
}

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening endpoint.
    pub endpoint: Endpoint,
    /// Protocol spoken on accepted sockets.
    pub protocol: Protocol,
    /// Keep-alive policy for HTTP connections. FastCGI connections always
    /// close after one request.
    pub keep_alive: KeepAlive,
    /// Admission policy.
    pub connection_policy: ConnectionPolicy,
}

impl ServerConfig {
    /// Configuration for `endpoint` with every policy at its default.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            protocol: Protocol::default(),
            keep_alive: KeepAlive::default(),
            connection_policy: ConnectionPolicy::default(),
        }
    }
}
