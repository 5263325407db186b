//! Connection-upgrade registry.
//!
//! A process-wide mapping from protocol name to factory. The HTTP
//! processor routes requests with `Connection: Upgrade` here after the
//! `101 Switching Protocols` response is written; the listener routes
//! non-`http/1.1` ALPN names here before any HTTP exchange exists.

use crate::{http::request::ServerRequest, server::server_impl::ServerResponse};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, OnceLock, RwLock},
};

/// Owns the socket after a protocol switch.
///
/// The drive loop feeds inbound bytes to [`data`](Self::data) and writes
/// whatever the processor puts in `out` back to the peer. Returning
/// `Ok(false)` closes the connection.
pub trait UpgradeProcessor: Send + 'static {
    /// Handles `bytes` from the peer; response bytes go into `out`.
    fn data(&mut self, bytes: &[u8], out: &mut Vec<u8>) -> io::Result<bool>;

    /// The peer closed the socket.
    fn socket_closed(&mut self) {}
}

/// Creates replacement processors for one named sub-protocol.
pub trait ConnectionUpgradeFactory: Send + Sync + 'static {
    /// Protocol name as it appears in the `Upgrade` header or in ALPN.
    /// Matched without regard to case.
    fn name(&self) -> &str;

    /// Called after an upgrade request has been parsed, with the `101`
    /// response still open. Accept by returning the replacement
    /// processor; reject by setting an error status on the response and
    /// returning a message (the connection closes after the rejection is
    /// written).
    fn upgrade(
        &self,
        request: &ServerRequest,
        response: &mut ServerResponse<'_>,
    ) -> Result<Box<dyn UpgradeProcessor>, String>;

    /// ALPN path: create a processor for a connection that never speaks
    /// HTTP. `None` (the default) drops such connections.
    fn accept_raw(&self) -> Option<Box<dyn UpgradeProcessor>> {
        None
    }
}

/// Name → factory mapping, shared by every server in the process.
#[derive(Default)]
pub struct UpgradeRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ConnectionUpgradeFactory>>>,
}

impl UpgradeRegistry {
    /// Registers `factory` under its own name, replacing any previous
    /// registration of that name.
    pub fn register(&self, factory: Arc<dyn ConnectionUpgradeFactory>) {
        let name = factory.name().to_ascii_lowercase();
        self.factories.write().unwrap().insert(name, factory);
    }

    /// Looks a factory up by protocol name, ignoring case.
    pub fn factory(&self, name: &str) -> Option<Arc<dyn ConnectionUpgradeFactory>> {
        self.factories
            .read()
            .unwrap()
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Names of every registered protocol.
    pub fn names(&self) -> Vec<String> {
        self.factories.read().unwrap().keys().cloned().collect()
    }
}

/// The process-wide registry.
pub fn upgrade_registry() -> &'static UpgradeRegistry {
    static REGISTRY: OnceLock<UpgradeRegistry> = OnceLock::new();
    REGISTRY.get_or_init(UpgradeRegistry::default)
}
