//! Endpoint binding and the accept loop.
//!
//! Sockets are built through `socket2` so the listener controls address
//! reuse, `SO_REUSEPORT`, and the backlog explicitly. The accept task
//! never blocks on a handshake: TLS (when configured) runs on the
//! per-connection task it spawns.

use crate::{
    config::{Endpoint, Protocol},
    errors::ServerError,
    server::{
        handler::{run_fcgi, run_http, run_raw, ConnectionContext},
        manager::SERVICE_UNAVAILABLE,
        server_impl::ServerDelegate,
    },
    stream::Duplex,
    tls::TlsDelegate,
    upgrade::upgrade_registry,
};
use socket2::{Domain, Socket, Type};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::Notify,
};
use tracing::{debug, error, info};

#[cfg(target_os = "linux")]
const BACKLOG: i32 = 511;
#[cfg(not(target_os = "linux"))]
const BACKLOG: i32 = 128;

pub(crate) enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

pub(crate) enum AcceptedStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl AcceptedStream {
    fn into_duplex(self) -> Box<dyn Duplex> {
        match self {
            AcceptedStream::Tcp(stream) => Box::new(stream),
            #[cfg(unix)]
            AcceptedStream::Unix(stream) => Box::new(stream),
        }
    }
}

impl BoundListener {
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BoundListener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            BoundListener::Unix(_) => None,
        }
    }

    async fn accept(&self) -> io::Result<(AcceptedStream, String)> {
        match self {
            BoundListener::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                Ok((AcceptedStream::Tcp(stream), remote.to_string()))
            }
            #[cfg(unix)]
            BoundListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((AcceptedStream::Unix(stream), "unix".to_string()))
            }
        }
    }
}

/// Binds `endpoint`. Port `0` asks the kernel for an ephemeral port.
pub(crate) fn bind(endpoint: &Endpoint) -> Result<BoundListener, ServerError> {
    match endpoint {
        Endpoint::Tcp {
            port,
            address,
            allow_port_reuse,
        } => {
            let ip: IpAddr = match address {
                Some(address) => address.parse().map_err(|_| {
                    bind_error(
                        endpoint,
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "bind address must be an IP literal",
                        ),
                    )
                })?,
                None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            };
            let addr = SocketAddr::new(ip, *port);

            let bound = (|| -> io::Result<TcpListener> {
                let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
                socket.set_reuse_address(true)?;
                #[cfg(unix)]
                if *allow_port_reuse {
                    socket.set_reuse_port(true)?;
                }
                socket.bind(&addr.into())?;
                socket.listen(BACKLOG)?;
                socket.set_nonblocking(true)?;
                TcpListener::from_std(socket.into())
            })()
            .map_err(|source| bind_error(endpoint, source))?;

            Ok(BoundListener::Tcp(bound))
        }

        #[cfg(unix)]
        Endpoint::Unix { path } => {
            // A previous run may have left its socket file behind.
            let _ = std::fs::remove_file(path);

            let bound = (|| -> io::Result<tokio::net::UnixListener> {
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.bind(&socket2::SockAddr::unix(path)?)?;
                socket.listen(BACKLOG)?;
                socket.set_nonblocking(true)?;
                tokio::net::UnixListener::from_std(socket.into())
            })()
            .map_err(|source| bind_error(endpoint, source))?;

            Ok(BoundListener::Unix(bound))
        }

        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(bind_error(
            endpoint,
            io::Error::new(io::ErrorKind::Unsupported, "unix sockets need a unix host"),
        )),
    }
}

fn bind_error(endpoint: &Endpoint, source: io::Error) -> ServerError {
    ServerError::Bind {
        endpoint: endpoint.describe(),
        source,
    }
}

/// Accepts connections until stopped. Admission runs before the
/// per-connection task is spawned; the TLS handshake runs on that task.
pub(crate) async fn accept_loop<D: ServerDelegate, T: TlsDelegate>(
    listener: BoundListener,
    ctx: ConnectionContext<D>,
    tls: Option<Arc<T>>,
    protocol: Protocol,
    stop: Arc<Notify>,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.notified() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                if !ctx.manager.admit() {
                    debug!(%remote, "connection limit reached, rejecting");
                    tokio::spawn(async move {
                        let mut stream = stream.into_duplex();
                        let _ = stream.write_all(SERVICE_UNAVAILABLE).await;
                        let _ = stream.flush().await;
                    });
                    continue;
                }

                let ctx = ctx.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    handshake_and_route(ctx, tls, protocol, stream, remote).await;
                });
            }
            Err(err) => {
                if ctx.lifecycle.is_stopped() {
                    info!(%err, "accept failed during shutdown");
                    break;
                }
                ctx.lifecycle.notify_connection_failed(&err);
            }
        }
    }
}

async fn handshake_and_route<D: ServerDelegate, T: TlsDelegate>(
    ctx: ConnectionContext<D>,
    tls: Option<Arc<T>>,
    protocol: Protocol,
    accepted: AcceptedStream,
    remote: String,
) {
    let (stream, alpn) = match (accepted, tls) {
        (AcceptedStream::Tcp(tcp), Some(tls)) => match tls.accept(tcp).await {
            Ok(accepted) => (accepted.stream, accepted.alpn),
            Err(err) => {
                debug!(%remote, %err, "TLS handshake failed");
                ctx.lifecycle.notify_connection_failed(&err);
                return;
            }
        },
        (stream, _) => (stream.into_duplex(), None),
    };

    let handle = ctx.manager.register(remote);
    match alpn.as_deref() {
        // No ALPN, or plain HTTP/1.1, runs the configured protocol.
        None | Some("http/1.1") => match protocol {
            Protocol::Http => run_http(ctx, handle, stream).await,
            Protocol::FastCgi => run_fcgi(ctx, handle, stream).await,
        },
        Some(name) => match upgrade_registry().factory(name).and_then(|f| f.accept_raw()) {
            Some(processor) => run_raw(ctx.manager.clone(), handle, stream, processor).await,
            None => {
                // No processor exists, so nothing can write a response.
                error!(name, "no processor for negotiated protocol, dropping connection");
                ctx.manager.release(handle.id());
            }
        },
    }
}
