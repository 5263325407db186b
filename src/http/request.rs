//! The request as assembled from parser events.

use crate::{
    buffer::BufferList,
    http::types::{Headers, Version},
};
use tracing::error;

/// A fully parsed inbound request, HTTP or FastCGI.
///
/// Every field is fixed by the time the delegate sees it; only the body
/// read cursor moves.
#[derive(Debug, Default)]
pub struct ServerRequest {
    pub(crate) method: String,
    pub(crate) version: Version,
    pub(crate) headers: Headers,
    pub(crate) url: Vec<u8>,
    pub(crate) body: BufferList,
    pub(crate) remote_address: String,
    pub(crate) secure: bool,
    full_url: Option<String>,
}

impl ServerRequest {
    /// Request method, e.g. `GET`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Negotiated HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Raw request target bytes: path plus query, as received.
    pub fn url(&self) -> &[u8] {
        &self.url
    }

    /// Address of the peer: `host:port` for TCP, the socket path for
    /// Unix-domain connections.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// True when the connection arrived through the TLS delegate.
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// The request URL rebuilt as `scheme://host<target>`. The scheme
    /// follows [`secure`](Self::secure); a missing `Host` header is
    /// reported and substituted with `Host_Not_Available`.
    pub fn url_string(&mut self) -> &str {
        if self.full_url.is_none() {
            let scheme = if self.secure { "https" } else { "http" };
            let host = match self.headers.get("Host") {
                Some(host) => host.to_string(),
                None => {
                    error!("request without a Host header, URL will be incomplete");
                    "Host_Not_Available".to_string()
                }
            };
            let target = String::from_utf8_lossy(&self.url);
            self.full_url = Some(format!("{scheme}://{host}{target}"));
        }
        self.full_url.as_deref().unwrap_or_default()
    }

    /// Copies up to `into.len()` body bytes, returning how many were read.
    pub fn read(&mut self, into: &mut [u8]) -> usize {
        self.body.fill(into)
    }

    /// Appends the entire remaining body to `into`, returning the count.
    pub fn read_all(&mut self, into: &mut Vec<u8>) -> usize {
        self.body.fill_vec(into)
    }

    /// Reads the remaining body as UTF-8 text; `None` when the bytes are
    /// not valid UTF-8.
    pub fn read_string(&mut self) -> Option<String> {
        let mut bytes = Vec::with_capacity(self.body.remaining());
        self.body.fill_vec(&mut bytes);
        match simdutf8::basic::from_utf8(&bytes) {
            Ok(_) => Some(unsafe { String::from_utf8_unchecked(bytes) }),
            Err(_) => None,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.method.clear();
        self.version = Version::default();
        self.headers.clear();
        self.url.clear();
        self.body.reset();
        self.full_url = None;
    }
}
