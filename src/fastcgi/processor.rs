//! Per-connection FastCGI responder state machine.
//!
//! One request per connection: initial → request-started (BEGIN_REQUEST)
//! → headers-complete (empty PARAMS) → request-complete (empty STDIN).
//! Additional BEGIN_REQUESTs with new ids are collected for multiplex
//! rejection after the primary response; a duplicate of the active id is
//! fatal.

use crate::{
    errors::RecordError,
    fastcgi::record::Record,
    http::{request::ServerRequest, types::Version},
};
use bytes::{Buf, BytesMut};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FcgiState {
    Initial,
    RequestStarted,
    HeadersComplete,
    RequestComplete,
}

/// What a pump produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FcgiPump {
    /// Need more record bytes.
    NeedMore,
    /// The request is complete; take it and dispatch.
    Request,
    /// BEGIN_REQUEST named a role other than responder; answer with
    /// END_REQUEST(UNKNOWN_ROLE) and close.
    UnsupportedRole { request_id: u16 },
}

pub(crate) struct FcgiProcessor {
    buf: BytesMut,
    state: FcgiState,
    request_id: u16,
    extra_request_ids: Vec<u16>,
    request: ServerRequest,
}

impl FcgiProcessor {
    pub(crate) fn new(remote_address: String, secure: bool) -> Self {
        let mut request = ServerRequest::default();
        // Socket peer is the fallback; a REMOTE_ADDR param overrides it.
        request.remote_address = remote_address;
        request.secure = secure;
        request.version = Version::HTTP_10;

        FcgiProcessor {
            buf: BytesMut::new(),
            state: FcgiState::Initial,
            request_id: 0,
            extra_request_ids: Vec::new(),
            request,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decodes queued records until the request completes or the buffer
    /// runs dry.
    pub(crate) fn pump(&mut self) -> Result<FcgiPump, RecordError> {
        loop {
            if self.state == FcgiState::RequestComplete {
                return Ok(FcgiPump::Request);
            }

            let (record, consumed) = match Record::parse(&self.buf) {
                Ok(parsed) => parsed,
                Err(RecordError::BufferExhausted) => return Ok(FcgiPump::NeedMore),
                Err(RecordError::UnsupportedRole(role)) => {
                    // The failing record sits at the front of the buffer,
                    // so its id is still readable from the raw header.
                    let request_id = u16::from_be_bytes([self.buf[2], self.buf[3]]);
                    debug!(role, request_id, "rejecting non-responder role");
                    return Ok(FcgiPump::UnsupportedRole { request_id });
                }
                Err(err) => return Err(err),
            };
            self.buf.advance(consumed);
            self.apply(record)?;
        }
    }

    /// The primary request id. Valid once the request has started.
    pub(crate) fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Ids of BEGIN_REQUESTs that tried to multiplex this connection.
    pub(crate) fn extra_request_ids(&self) -> &[u16] {
        &self.extra_request_ids
    }

    /// Moves the assembled request out. Valid after `pump` returned
    /// `Request`.
    pub(crate) fn take_request(&mut self) -> ServerRequest {
        std::mem::take(&mut self.request)
    }

    fn apply(&mut self, record: Record) -> Result<(), RecordError> {
        match record {
            Record::BeginRequest { request_id, .. } => match self.state {
                FcgiState::Initial => {
                    self.request_id = request_id;
                    self.state = FcgiState::RequestStarted;
                }
                // Duplicate of the active request id is a protocol error.
                _ if request_id == self.request_id => return Err(RecordError::Protocol),
                _ => {
                    if !self.extra_request_ids.contains(&request_id) {
                        self.extra_request_ids.push(request_id);
                    }
                }
            },

            Record::Params { request_id, params } => {
                if request_id != self.request_id {
                    debug!(request_id, "discarding PARAMS for inactive request id");
                } else if self.state == FcgiState::RequestStarted {
                    if params.is_empty() {
                        self.state = FcgiState::HeadersComplete;
                    } else {
                        for (name, value) in params {
                            self.apply_param(&name, &value);
                        }
                    }
                }
            }

            Record::Stdin { request_id, data } => {
                if request_id != self.request_id {
                    debug!(request_id, "discarding STDIN for inactive request id");
                } else if data.is_empty() {
                    self.state = FcgiState::RequestComplete;
                } else {
                    self.request.body.append(&data);
                }
            }

            // A responder never receives these.
            Record::EndRequest { .. } | Record::Stdout { .. } => return Err(RecordError::Protocol),
        }
        Ok(())
    }

    fn apply_param(&mut self, name: &[u8], value: &[u8]) {
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        let value = String::from_utf8_lossy(value).into_owned();

        match name.as_str() {
            "REQUEST_METHOD" => self.request.method = value,
            "REQUEST_URI" => self.request.url = value.into_bytes(),
            "REMOTE_ADDR" => self.request.remote_address = value,
            "SERVER_PROTOCOL" => {
                if let Some(version) = parse_server_protocol(&value) {
                    self.request.version = version;
                }
            }
            _ => match name.strip_prefix("HTTP_") {
                Some(rest) => {
                    let header = header_name_from_param(rest);
                    self.request.headers.append(&header, value);
                }
                // Everything else is CGI metadata this engine does not
                // forward.
                None => {}
            },
        }
    }
}

/// `HTTP/<major>.<minor>`; anything else keeps the default version.
fn parse_server_protocol(value: &str) -> Option<Version> {
    let rest = value.strip_prefix("HTTP/").or_else(|| value.strip_prefix("http/"))?;
    let (major, minor) = rest.split_once('.')?;
    Some(Version {
        major: major.parse().ok()?,
        minor: minor.parse().ok()?,
    })
}

/// `USER_AGENT` → `User-Agent`.
fn header_name_from_param(param: &str) -> String {
    let mut out = String::with_capacity(param.len());
    for (i, word) in param.split('_').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars.map(|c| c.to_ascii_lowercase()));
        }
    }
    out
}
