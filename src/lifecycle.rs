//! Lifecycle callbacks and the global request monitor.
//!
//! Start/stop callbacks have catch-up semantics: registering after the
//! event has fired runs the callback immediately. Failure callbacks fire
//! only for events after registration.

use crate::{errors::ServerError, http::request::ServerRequest, server::server_impl::ServerResponse};
use std::{
    io,
    sync::{Mutex, OnceLock},
};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Created,
    Started,
    Stopped,
    Failed,
}

type Callback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub(crate) struct LifecycleState {
    state: Mutex<Option<RunState>>,
    started: Mutex<Vec<Callback>>,
    stopped: Mutex<Vec<Callback>>,
    failed: Mutex<Vec<Box<dyn Fn(&ServerError) + Send + Sync>>>,
    connection_failed: Mutex<Vec<Box<dyn Fn(&io::Error) + Send + Sync>>>,
}

impl LifecycleState {
    pub(crate) fn new() -> Self {
        let lifecycle = LifecycleState::default();
        *lifecycle.state.lock().unwrap() = Some(RunState::Created);
        lifecycle
    }

    pub(crate) fn state(&self) -> RunState {
        self.state.lock().unwrap().unwrap_or(RunState::Created)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state() == RunState::Stopped
    }

    pub(crate) fn add_started(&self, callback: Callback) {
        if self.state() == RunState::Started {
            callback();
        }
        self.started.lock().unwrap().push(callback);
    }

    pub(crate) fn add_stopped(&self, callback: Callback) {
        if self.state() == RunState::Stopped {
            callback();
        }
        self.stopped.lock().unwrap().push(callback);
    }

    pub(crate) fn add_failed(&self, callback: Box<dyn Fn(&ServerError) + Send + Sync>) {
        self.failed.lock().unwrap().push(callback);
    }

    pub(crate) fn add_connection_failed(&self, callback: Box<dyn Fn(&io::Error) + Send + Sync>) {
        self.connection_failed.lock().unwrap().push(callback);
    }

    pub(crate) fn notify_started(&self, endpoint: &str) {
        *self.state.lock().unwrap() = Some(RunState::Started);
        info!(endpoint, "server started");
        for callback in self.started.lock().unwrap().iter() {
            callback();
        }
    }

    pub(crate) fn notify_stopped(&self) {
        *self.state.lock().unwrap() = Some(RunState::Stopped);
        info!("server stopped");
        for callback in self.stopped.lock().unwrap().iter() {
            callback();
        }
    }

    pub(crate) fn notify_failed(&self, error: &ServerError) {
        *self.state.lock().unwrap() = Some(RunState::Failed);
        for callback in self.failed.lock().unwrap().iter() {
            callback(error);
        }
    }

    pub(crate) fn notify_connection_failed(&self, error: &io::Error) {
        for callback in self.connection_failed.lock().unwrap().iter() {
            callback(error);
        }
    }
}

/// Observes every delegate invocation, HTTP and FastCGI alike.
pub trait ServerMonitor: Send + Sync + 'static {
    /// A parsed request is about to be dispatched.
    fn request_started(&self, _request: &ServerRequest, _response: &ServerResponse<'_>) {}

    /// The response for a request has ended. The request is absent when
    /// the exchange failed before one was assembled.
    fn request_finished(&self, _request: Option<&ServerRequest>, _response: &ServerResponse<'_>) {}
}

static MONITOR: OnceLock<Box<dyn ServerMonitor>> = OnceLock::new();

/// Installs the process-wide monitor. Returns `false` when one is already
/// installed; the first registration wins.
pub fn set_monitor(monitor: impl ServerMonitor) -> bool {
    MONITOR.set(Box::new(monitor)).is_ok()
}

pub(crate) fn monitor() -> Option<&'static dyn ServerMonitor> {
    MONITOR.get().map(|m| m.as_ref())
}
