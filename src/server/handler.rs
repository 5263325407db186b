//! Per-connection drive loops.
//!
//! One tokio task owns each accepted socket: it reads, feeds the
//! protocol processor, dispatches complete requests to the delegate, and
//! either resets for the next keep-alive cycle or tears the socket down.
//! Task ownership of the stream is what serializes writes per
//! connection.

use crate::{
    config::{KeepAlive, IDLE_SWEEP_INTERVAL},
    errors::{is_disconnect, ParseError},
    fastcgi::{
        processor::{FcgiProcessor, FcgiPump},
        response::{reject_unsupported_role, FcgiResponse},
    },
    http::{
        processor::{HttpProcessor, Pump},
        response::{HttpResponse, KeepAliveDecision},
    },
    lifecycle::{monitor, LifecycleState},
    server::{
        manager::{ConnectionHandle, ConnectionManager},
        server_impl::{ServerDelegate, ServerResponse},
    },
    stream::Duplex,
    upgrade::{upgrade_registry, UpgradeProcessor},
};
use bytes::BytesMut;
use std::{io, sync::Arc, time::Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error};

const READ_BUFFER: usize = 8 * 1024;

/// Everything a connection task needs from the server.
pub(crate) struct ConnectionContext<D> {
    pub(crate) delegate: Arc<D>,
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) lifecycle: Arc<LifecycleState>,
    pub(crate) keep_alive: KeepAlive,
    pub(crate) secure: bool,
}

impl<D> Clone for ConnectionContext<D> {
    fn clone(&self) -> Self {
        ConnectionContext {
            delegate: self.delegate.clone(),
            manager: self.manager.clone(),
            lifecycle: self.lifecycle.clone(),
            keep_alive: self.keep_alive,
            secure: self.secure,
        }
    }
}

/// Drives one HTTP connection to completion.
pub(crate) async fn run_http<D: ServerDelegate>(
    ctx: ConnectionContext<D>,
    handle: Arc<ConnectionHandle>,
    mut stream: Box<dyn Duplex>,
) {
    let mut processor = HttpProcessor::new(ctx.keep_alive, ctx.secure, handle.remote.clone());
    let mut read_buf = vec![0u8; READ_BUFFER];

    'conn: loop {
        // Drain buffered requests before reading again, so pipelined
        // responses leave in request order.
        loop {
            match processor.pump() {
                Ok(Pump::NeedMore) => break,
                Ok(Pump::Request) => {
                    if !dispatch_http(&ctx, &mut processor, stream.as_mut()).await {
                        break 'conn;
                    }
                }
                Ok(Pump::Upgrade) => {
                    upgrade(&mut processor, &mut stream, &handle).await;
                    break 'conn;
                }
                Err(err) => {
                    bad_request(&ctx, err, stream.as_mut()).await;
                    break 'conn;
                }
            }
        }

        handle.set_idle_deadline(Instant::now() + IDLE_SWEEP_INTERVAL);
        handle.set_in_progress(false);

        let n = tokio::select! {
            _ = handle.closed() => break 'conn,
            result = stream.read(&mut read_buf) => match result {
                Ok(0) => {
                    if let Some(err) = processor.socket_closed() {
                        ctx.lifecycle.notify_connection_failed(&io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            err,
                        ));
                    }
                    break 'conn;
                }
                Ok(n) => n,
                Err(err) => {
                    if !is_disconnect(&err) {
                        debug!(remote = %handle.remote, %err, "socket read failed");
                    }
                    break 'conn;
                }
            },
        };

        handle.set_in_progress(true);
        processor.push(&read_buf[..n]);
    }

    ctx.manager.release(handle.id());
}

/// Dispatches one parsed request. Returns whether the connection should
/// be kept for the next request.
async fn dispatch_http<D: ServerDelegate>(
    ctx: &ConnectionContext<D>,
    processor: &mut HttpProcessor,
    stream: &mut dyn Duplex,
) -> bool {
    let decision = processor.keep_alive_decision();
    let mut request = processor.take_request();
    let mut response = ServerResponse::http(HttpResponse::new(stream, decision));

    if let Some(monitor) = monitor() {
        monitor.request_started(&request, &response);
    }

    let finished = match ctx.delegate.handle(&mut request, &mut response).await {
        Ok(()) => match response.end().await {
            Ok(()) => true,
            Err(err) => {
                if !is_disconnect(&err) {
                    debug!(%err, "response flush failed");
                }
                false
            }
        },
        Err(err) => {
            error!(%err, "delegate failed");
            let _ = response.end().await;
            false
        }
    };

    if let Some(monitor) = monitor() {
        monitor.request_finished(Some(&request), &response);
    }

    let keep = processor.keep_alive_allowed();
    processor.request_completed();
    finished && keep
}

/// One `400 Bad Request` with `Connection: Close`, then the caller tears
/// the connection down. Write failures are ignored.
async fn bad_request<D>(ctx: &ConnectionContext<D>, err: ParseError, stream: &mut dyn Duplex) {
    debug!(%err, "rejecting malformed request");
    ctx.lifecycle
        .notify_connection_failed(&io::Error::new(io::ErrorKind::InvalidData, err));

    let mut response = HttpResponse::new(stream, KeepAliveDecision::close());
    response.set_status(400);
    response.headers_mut().set("Content-Length", vec!["0".into()]);
    let _ = response.end().await;
}

/// Routes an upgrade request through the registry. On acceptance the
/// replacement processor takes the socket over, starting with any bytes
/// the HTTP parser had not consumed.
async fn upgrade(
    processor: &mut HttpProcessor,
    stream: &mut Box<dyn Duplex>,
    handle: &ConnectionHandle,
) {
    let request = processor.take_request();
    let protocol = request
        .headers()
        .get("Upgrade")
        .unwrap_or_default()
        .to_string();

    let mut response =
        ServerResponse::http(HttpResponse::new(stream.as_mut(), KeepAliveDecision::close()));
    response.set_status(101);

    let Some(factory) = upgrade_registry().factory(&protocol) else {
        error!(%protocol, "no upgrade factory registered");
        response.set_status(404);
        let _ = response
            .end_with(format!("No upgrade handler for {protocol}"))
            .await;
        return;
    };

    match factory.upgrade(&request, &mut response) {
        Ok(replacement) => {
            if response.end().await.is_err() {
                return;
            }
            drop(response);
            let initial = processor.take_retained();
            run_upgraded(replacement, initial, stream.as_mut(), handle).await;
        }
        Err(reason) => {
            debug!(%protocol, %reason, "upgrade rejected");
            if response.status() == 101 {
                response.set_status(400);
            }
            let _ = response.end_with(reason).await;
        }
    }
}

/// Drives a post-upgrade (or raw-ALPN) processor. Upgraded connections
/// stay in-progress, so the idle sweeper leaves them alone.
async fn run_upgraded(
    mut processor: Box<dyn UpgradeProcessor>,
    initial: BytesMut,
    stream: &mut dyn Duplex,
    handle: &ConnectionHandle,
) {
    let mut out = Vec::new();
    if !initial.is_empty() && !pump_upgraded(processor.as_mut(), &initial, &mut out, stream).await {
        return;
    }

    let mut read_buf = vec![0u8; READ_BUFFER];
    loop {
        let n = tokio::select! {
            _ = handle.closed() => return,
            result = stream.read(&mut read_buf) => match result {
                Ok(0) => {
                    processor.socket_closed();
                    return;
                }
                Ok(n) => n,
                Err(_) => return,
            },
        };
        if !pump_upgraded(processor.as_mut(), &read_buf[..n], &mut out, stream).await {
            return;
        }
    }
}

async fn pump_upgraded(
    processor: &mut dyn UpgradeProcessor,
    bytes: &[u8],
    out: &mut Vec<u8>,
    stream: &mut dyn Duplex,
) -> bool {
    out.clear();
    match processor.data(bytes, out) {
        Ok(keep_going) => {
            if !out.is_empty() && (stream.write_all(out).await.is_err() || stream.flush().await.is_err())
            {
                return false;
            }
            keep_going
        }
        Err(err) => {
            debug!(%err, "upgraded protocol error");
            false
        }
    }
}

/// Entry point for raw-ALPN connections that never speak HTTP.
pub(crate) async fn run_raw(
    manager: Arc<ConnectionManager>,
    handle: Arc<ConnectionHandle>,
    mut stream: Box<dyn Duplex>,
    processor: Box<dyn UpgradeProcessor>,
) {
    run_upgraded(processor, BytesMut::new(), stream.as_mut(), &handle).await;
    manager.release(handle.id());
}

/// Drives one FastCGI connection: exactly one request, then close.
pub(crate) async fn run_fcgi<D: ServerDelegate>(
    ctx: ConnectionContext<D>,
    handle: Arc<ConnectionHandle>,
    mut stream: Box<dyn Duplex>,
) {
    let mut processor = FcgiProcessor::new(handle.remote.clone(), ctx.secure);
    let mut read_buf = vec![0u8; READ_BUFFER];

    let ready = 'read: loop {
        match processor.pump() {
            Ok(FcgiPump::Request) => break 'read true,
            Ok(FcgiPump::UnsupportedRole { request_id }) => {
                let _ = reject_unsupported_role(stream.as_mut(), request_id).await;
                break 'read false;
            }
            Ok(FcgiPump::NeedMore) => {}
            Err(err) => {
                debug!(remote = %handle.remote, %err, "FastCGI protocol error");
                ctx.lifecycle
                    .notify_connection_failed(&io::Error::new(io::ErrorKind::InvalidData, err));
                break 'read false;
            }
        }

        handle.set_idle_deadline(Instant::now() + IDLE_SWEEP_INTERVAL);
        handle.set_in_progress(false);

        let n = tokio::select! {
            _ = handle.closed() => break 'read false,
            result = stream.read(&mut read_buf) => match result {
                // Client disconnect closes silently.
                Ok(0) => break 'read false,
                Ok(n) => n,
                Err(err) => {
                    if !is_disconnect(&err) {
                        debug!(remote = %handle.remote, %err, "socket read failed");
                    }
                    break 'read false;
                }
            },
        };

        handle.set_in_progress(true);
        processor.push(&read_buf[..n]);
    };

    if ready {
        dispatch_fcgi(&ctx, &mut processor, stream.as_mut()).await;
    }
    ctx.manager.release(handle.id());
}

async fn dispatch_fcgi<D: ServerDelegate>(
    ctx: &ConnectionContext<D>,
    processor: &mut FcgiProcessor,
    stream: &mut dyn Duplex,
) {
    let request_id = processor.request_id();
    let extras = processor.extra_request_ids().to_vec();
    let mut request = processor.take_request();
    let mut response = ServerResponse::fcgi(FcgiResponse::new(stream, request_id, extras));

    if let Some(monitor) = monitor() {
        monitor.request_started(&request, &response);
    }

    match ctx.delegate.handle(&mut request, &mut response).await {
        Ok(()) => {
            if let Err(err) = response.end().await {
                if !is_disconnect(&err) {
                    debug!(%err, "response flush failed");
                }
            }
        }
        Err(err) => {
            error!(%err, "delegate failed");
            let _ = response.end().await;
        }
    }

    if let Some(monitor) = monitor() {
        monitor.request_finished(Some(&request), &response);
    }
}
