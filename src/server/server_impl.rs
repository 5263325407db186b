//! Server assembly: builder, listener wiring, and the delegate surface.

use crate::{
    config::{ConnectionPolicy, Endpoint, KeepAlive, Protocol, ServerConfig},
    errors::ServerError,
    fastcgi::response::FcgiResponse,
    http::{request::ServerRequest, response::HttpResponse, types::Headers},
    lifecycle::LifecycleState,
    server::{handler::ConnectionContext, listener, manager::ConnectionManager},
    tls::{NoTls, TlsDelegate},
    upgrade::upgrade_registry,
};
use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::Notify;

/// The application half of the core: called exactly once per parsed
/// request, HTTP or FastCGI.
///
/// # Examples
///
/// ```no_run
/// use harbor_net::{Endpoint, Server, ServerDelegate, ServerRequest, ServerResponse};
/// use std::io;
///
/// struct Hello;
///
/// impl ServerDelegate for Hello {
///     async fn handle(
///         &self,
///         _request: &mut ServerRequest,
///         response: &mut ServerResponse<'_>,
///     ) -> io::Result<()> {
///         response.headers_mut().append("Content-Type", "text/plain");
///         response.end_with("Hello world!").await
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let server = Server::builder()
///         .endpoint(Endpoint::tcp(8080))
///         .delegate(Hello)
///         .build();
///     server.listen().await.unwrap();
///     std::future::pending::<()>().await;
/// }
/// ```
pub trait ServerDelegate: Send + Sync + 'static {
    /// Produces the response for one request. Read the body through
    /// `request`, write through `response`, and call
    /// [`end`](ServerResponse::end) exactly once (the drive loop ends an
    /// un-ended response after `handle` returns).
    fn handle(
        &self,
        request: &mut ServerRequest,
        response: &mut ServerResponse<'_>,
    ) -> impl Future<Output = io::Result<()>> + Send;
}

enum ResponseInner<'a> {
    Http(HttpResponse<'a>),
    Fcgi(FcgiResponse<'a>),
}

/// The response writer handed to the delegate.
///
/// Writes stream to the socket through a small buffer; the first write
/// (or `end`) irrevocably flushes the status and headers. Whether the
/// bytes leave as an HTTP/1.1 response or as FastCGI STDOUT records is
/// decided by the connection, not the delegate.
pub struct ServerResponse<'a> {
    inner: ResponseInner<'a>,
}

impl<'a> ServerResponse<'a> {
    pub(crate) fn http(inner: HttpResponse<'a>) -> Self {
        ServerResponse {
            inner: ResponseInner::Http(inner),
        }
    }

    pub(crate) fn fcgi(inner: FcgiResponse<'a>) -> Self {
        ServerResponse {
            inner: ResponseInner::Fcgi(inner),
        }
    }

    /// Current status code; `200` unless changed.
    pub fn status(&self) -> u16 {
        match &self.inner {
            ResponseInner::Http(r) => r.status(),
            ResponseInner::Fcgi(r) => r.status(),
        }
    }

    /// Sets the status code. Silently ignored once the header block has
    /// been flushed.
    pub fn set_status(&mut self, code: u16) {
        match &mut self.inner {
            ResponseInner::Http(r) => r.set_status(code),
            ResponseInner::Fcgi(r) => r.set_status(code),
        }
    }

    /// Response headers. `Date` is pre-populated. Mutations after the
    /// header block has been flushed have no effect on the wire.
    pub fn headers_mut(&mut self) -> &mut Headers {
        match &mut self.inner {
            ResponseInner::Http(r) => r.headers_mut(),
            ResponseInner::Fcgi(r) => r.headers_mut(),
        }
    }

    /// Writes body bytes, flushing the header block first if needed.
    pub async fn write(&mut self, data: impl AsRef<[u8]>) -> io::Result<()> {
        match &mut self.inner {
            ResponseInner::Http(r) => r.write(data.as_ref()).await,
            ResponseInner::Fcgi(r) => r.write(data.as_ref()).await,
        }
    }

    /// Finishes the response. Idempotent.
    pub async fn end(&mut self) -> io::Result<()> {
        match &mut self.inner {
            ResponseInner::Http(r) => r.end().await,
            ResponseInner::Fcgi(r) => r.end().await,
        }
    }

    /// Writes `data` and finishes the response.
    pub async fn end_with(&mut self, data: impl AsRef<[u8]>) -> io::Result<()> {
        self.write(data).await?;
        self.end().await
    }

    /// True once `end` has completed.
    pub fn ended(&self) -> bool {
        match &self.inner {
            ResponseInner::Http(r) => r.ended(),
            ResponseInner::Fcgi(r) => r.ended(),
        }
    }
}

/// An HTTP/FastCGI server bound to one endpoint.
///
/// Built through [`Server::builder`]; [`listen`](Server::listen) binds
/// the endpoint and starts accepting, [`stop`](Server::stop) closes the
/// listener and every live connection.
pub struct Server<D: ServerDelegate, T: TlsDelegate = NoTls> {
    delegate: Arc<D>,
    tls: Option<Arc<T>>,
    config: ServerConfig,
    manager: Arc<ConnectionManager>,
    lifecycle: Arc<LifecycleState>,
    stop: Arc<Notify>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    listening: AtomicBool,
}

impl<D: ServerDelegate> Server<D, NoTls> {
    /// Creates a new builder. `endpoint` and `delegate` are required.
    pub fn builder() -> ServerBuilder<D, NoTls> {
        ServerBuilder {
            endpoint: None,
            delegate: None,
            tls: None,
            protocol: Protocol::default(),
            keep_alive: KeepAlive::default(),
            connection_policy: ConnectionPolicy::default(),
        }
    }
}

impl<D: ServerDelegate, T: TlsDelegate> Server<D, T> {
    /// Binds the endpoint and starts the accept loop. Returns once the
    /// listener is live; bind failures fire the `failed` callbacks and
    /// surface to the caller.
    pub async fn listen(&self) -> Result<(), ServerError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ServerError::InvalidState { state: "listening" });
        }

        let listener = match listener::bind(&self.config.endpoint) {
            Ok(listener) => listener,
            Err(error) => {
                self.lifecycle.notify_failed(&error);
                return Err(error);
            }
        };
        *self.local_addr.lock().unwrap() = listener.local_addr();

        if let Some(tls) = &self.tls {
            tls.add_supported_alpn("http/1.1");
            for name in upgrade_registry().names() {
                tls.add_supported_alpn(&name);
            }
        }

        let ctx = ConnectionContext {
            delegate: self.delegate.clone(),
            manager: self.manager.clone(),
            lifecycle: self.lifecycle.clone(),
            keep_alive: self.config.keep_alive,
            secure: self.tls.as_ref().map(|t| t.is_secure()).unwrap_or(false),
        };
        tokio::spawn(listener::accept_loop(
            listener,
            ctx,
            self.tls.clone(),
            self.config.protocol,
            self.stop.clone(),
        ));

        self.lifecycle.notify_started(&self.config.endpoint.describe());
        Ok(())
    }

    /// The bound TCP port, once listening. With an endpoint port of `0`
    /// this is the ephemeral port the kernel picked.
    pub fn port(&self) -> Option<u16> {
        self.local_addr.lock().unwrap().map(|addr| addr.port())
    }

    /// Closes the listening socket and every live connection. Accept
    /// errors after this point log at info severity.
    pub fn stop(&self) {
        if self.lifecycle.is_stopped() {
            return;
        }
        self.lifecycle.notify_stopped();
        self.stop.notify_one();
        self.manager.close_all();
    }

    /// Runs `callback` once the server has started; fires immediately if
    /// it already has.
    pub fn on_started(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lifecycle.add_started(Box::new(callback));
    }

    /// Runs `callback` once the server has stopped; fires immediately if
    /// it already has.
    pub fn on_stopped(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lifecycle.add_stopped(Box::new(callback));
    }

    /// Runs `callback` when the server fails to start.
    pub fn on_failed(&self, callback: impl Fn(&ServerError) + Send + Sync + 'static) {
        self.lifecycle.add_failed(Box::new(callback));
    }

    /// Runs `callback` when accepting or handshaking a client connection
    /// fails. The accept loop keeps running.
    pub fn on_client_connection_failed(
        &self,
        callback: impl Fn(&io::Error) + Send + Sync + 'static,
    ) {
        self.lifecycle.add_connection_failed(Box::new(callback));
    }
}

/// Builder for [`Server`] instances.
pub struct ServerBuilder<D: ServerDelegate, T: TlsDelegate = NoTls> {
    endpoint: Option<Endpoint>,
    delegate: Option<D>,
    tls: Option<T>,
    protocol: Protocol,
    keep_alive: KeepAlive,
    connection_policy: ConnectionPolicy,
}

impl<D: ServerDelegate, T: TlsDelegate> ServerBuilder<D, T> {
    /// Sets the listening endpoint. **Required.**
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the request delegate. **Required.**
    pub fn delegate(mut self, delegate: D) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Applies a complete [`ServerConfig`] in one call.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.endpoint = Some(config.endpoint);
        self.protocol = config.protocol;
        self.keep_alive = config.keep_alive;
        self.connection_policy = config.connection_policy;
        self
    }

    /// Installs a TLS delegate; accepted sockets are handed to it for
    /// the handshake before any protocol work.
    pub fn tls<NewT: TlsDelegate>(self, tls: NewT) -> ServerBuilder<D, NewT> {
        ServerBuilder {
            endpoint: self.endpoint,
            delegate: self.delegate,
            tls: Some(tls),
            protocol: self.protocol,
            keep_alive: self.keep_alive,
            connection_policy: self.connection_policy,
        }
    }

    /// Selects the protocol accepted sockets speak (default HTTP).
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the keep-alive policy (default unlimited).
    pub fn keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the admission policy (default unlimited connections).
    pub fn connection_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.connection_policy = policy;
        self
    }

    /// Finalizes the builder.
    ///
    /// # Panics
    ///
    /// Panics when [`endpoint`](Self::endpoint) or
    /// [`delegate`](Self::delegate) was not called.
    #[track_caller]
    pub fn build(self) -> Server<D, T> {
        let endpoint = self
            .endpoint
            .expect("The `endpoint` method must be called to create");
        let delegate = self
            .delegate
            .expect("The `delegate` method must be called to create");

        let config = ServerConfig {
            endpoint,
            protocol: self.protocol,
            keep_alive: self.keep_alive,
            connection_policy: self.connection_policy,
        };

        Server {
            delegate: Arc::new(delegate),
            tls: self.tls.map(Arc::new),
            manager: Arc::new(ConnectionManager::new(config.connection_policy)),
            lifecycle: Arc::new(LifecycleState::new()),
            stop: Arc::new(Notify::new()),
            local_addr: Arc::new(Mutex::new(None)),
            listening: AtomicBool::new(false),
            config,
        }
    }
}
