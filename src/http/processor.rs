//! Per-connection HTTP state machine.
//!
//! Owns the parser, the request under assembly, the unconsumed byte
//! remainder (pipelining), and the keep-alive counter. The drive loop
//! pushes socket bytes in and pumps complete requests out; responses for
//! pipelined requests are produced strictly in request order because the
//! remainder is only pumped again after the current response has ended.

use crate::{
    config::{KeepAlive, IDLE_SWEEP_INTERVAL},
    errors::ParseError,
    http::{
        parser::{HttpParser, ParseSink},
        request::ServerRequest,
        response::KeepAliveDecision,
        types::Version,
    },
};
use bytes::{Buf, BytesMut};
use tracing::debug;

/// What a pump produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pump {
    /// No complete message buffered; read more from the socket.
    NeedMore,
    /// One complete request is ready; take it and dispatch.
    Request,
    /// A complete upgrade request is ready; route through the registry.
    Upgrade,
}

/// Builds a [`ServerRequest`] from parser events. Header name and value
/// chunks accumulate in scratch buffers; a field chunk arriving while a
/// value is open commits the previous pair.
#[derive(Default)]
struct Assembly {
    request: ServerRequest,
    field_scratch: Vec<u8>,
    value_scratch: Vec<u8>,
    value_open: bool,
    message_done: bool,
}

impl Assembly {
    fn commit_header(&mut self) {
        let name = String::from_utf8_lossy(&self.field_scratch).into_owned();
        let value = String::from_utf8_lossy(&self.value_scratch).into_owned();
        self.request.headers.append(&name, value);
        self.field_scratch.clear();
        self.value_scratch.clear();
        self.value_open = false;
    }

    fn clear(&mut self) {
        self.request.clear();
        self.field_scratch.clear();
        self.value_scratch.clear();
        self.value_open = false;
        self.message_done = false;
    }
}

impl ParseSink for Assembly {
    fn on_url(&mut self, chunk: &[u8]) {
        self.request.url.extend_from_slice(chunk);
    }

    fn on_header_field(&mut self, chunk: &[u8]) {
        if self.value_open {
            self.commit_header();
        }
        self.field_scratch.extend_from_slice(chunk);
    }

    fn on_header_value(&mut self, chunk: &[u8]) {
        self.value_open = true;
        self.value_scratch.extend_from_slice(chunk);
    }

    fn on_headers_complete(&mut self, method: &str, version: Version) {
        if self.value_open {
            self.commit_header();
        }
        self.request.method = method.to_string();
        self.request.version = version;
    }

    fn on_body(&mut self, chunk: &[u8]) {
        self.request.body.append(chunk);
    }

    fn on_message_complete(&mut self) {
        self.message_done = true;
    }
}

pub(crate) struct HttpProcessor {
    parser: HttpParser,
    assembly: Assembly,
    retained: BytesMut,
    remote_address: String,
    secure: bool,
    policy: KeepAlive,
    /// Requests left under `KeepAlive::Limited`.
    remaining: Option<u32>,
    decision: KeepAliveDecision,
    poisoned: bool,
}

impl HttpProcessor {
    pub(crate) fn new(policy: KeepAlive, secure: bool, remote_address: String) -> Self {
        let remaining = match policy {
            KeepAlive::Limited(n) => Some(n),
            _ => None,
        };
        HttpProcessor {
            parser: HttpParser::new(),
            assembly: Assembly::default(),
            retained: BytesMut::new(),
            remote_address,
            secure,
            policy,
            remaining,
            decision: KeepAliveDecision::close(),
            poisoned: false,
        }
    }

    /// Queues socket bytes for parsing. A poisoned processor refuses them.
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        if !self.poisoned {
            self.retained.extend_from_slice(bytes);
        }
    }

    /// Parses queued bytes up to at most one complete request.
    pub(crate) fn pump(&mut self) -> Result<Pump, ParseError> {
        if self.poisoned || self.retained.is_empty() {
            return Ok(Pump::NeedMore);
        }

        let consumed = match self.parser.execute(&self.retained, &mut self.assembly) {
            Ok(consumed) => consumed,
            Err(err) => {
                self.poisoned = true;
                self.decision = KeepAliveDecision::close();
                self.retained.clear();
                return Err(err);
            }
        };
        self.retained.advance(consumed);

        if !self.assembly.message_done {
            return Ok(Pump::NeedMore);
        }

        self.decision = self.compute_decision();
        if self.is_upgrade_request() {
            Ok(Pump::Upgrade)
        } else {
            Ok(Pump::Request)
        }
    }

    /// Moves the assembled request out. Valid after `pump` returned
    /// `Request` or `Upgrade`.
    pub(crate) fn take_request(&mut self) -> ServerRequest {
        let mut request = std::mem::take(&mut self.assembly.request);
        request.remote_address = self.remote_address.clone();
        request.secure = self.secure;
        request
    }

    /// The connection-reuse decision for the request just pumped.
    pub(crate) fn keep_alive_decision(&self) -> KeepAliveDecision {
        self.decision
    }

    /// True iff headers, policy, and parser state all allow another
    /// request on this connection.
    pub(crate) fn keep_alive_allowed(&self) -> bool {
        self.decision.keep
    }

    /// Marks the current request finished: decrements the keep-alive
    /// counter and resets parser and assembly for the next cycle. The
    /// retained remainder is kept for the next pump.
    pub(crate) fn request_completed(&mut self) {
        if let Some(remaining) = &mut self.remaining {
            *remaining = remaining.saturating_sub(1);
        }
        self.parser.reset();
        self.assembly.clear();
    }

    /// Peer closed the socket. Retained bytes are discarded, never
    /// replayed. Returns the parse error to report when the close cut a
    /// message short.
    pub(crate) fn socket_closed(&mut self) -> Option<ParseError> {
        self.retained.clear();
        if self.parser.is_mid_message() {
            debug!(remote = %self.remote_address, "peer closed mid-request");
            Some(ParseError::UnexpectedEof)
        } else {
            None
        }
    }

    /// Hands the unparsed remainder to an upgrade processor.
    pub(crate) fn take_retained(&mut self) -> BytesMut {
        std::mem::take(&mut self.retained)
    }

    fn compute_decision(&self) -> KeepAliveDecision {
        if self.poisoned {
            return KeepAliveDecision::close();
        }

        let request = &self.assembly.request;
        let mut headers_allow = request.version == Version::HTTP_11;
        if let Some(values) = request.headers.get_all("Connection") {
            for token in values.iter().flat_map(|v| v.split(',')) {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    headers_allow = false;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    headers_allow = true;
                }
            }
        }

        let (keep, max_requests) = match (self.policy, self.remaining) {
            (KeepAlive::Disabled, _) => (false, None),
            (KeepAlive::Limited(_), Some(remaining)) => {
                (headers_allow && remaining > 1, Some(remaining.saturating_sub(1)))
            }
            _ => (headers_allow, None),
        };

        KeepAliveDecision {
            keep,
            idle_secs: IDLE_SWEEP_INTERVAL.as_secs(),
            max_requests,
        }
    }

    fn is_upgrade_request(&self) -> bool {
        let headers = &self.assembly.request.headers;
        let connection_upgrade = headers
            .get_all("Connection")
            .map(|values| {
                values
                    .iter()
                    .flat_map(|v| v.split(','))
                    .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);
        connection_upgrade && headers.get("Upgrade").is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(policy: KeepAlive) -> HttpProcessor {
        HttpProcessor::new(policy, false, "127.0.0.1:1".into())
    }

    #[test]
    fn three_pipelined_requests_in_order() {
        let one = "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 6\r\n\r\nabcdef";
        let mut p = processor(KeepAlive::Unlimited);
        p.push(one.repeat(3).as_bytes());

        for round in 0..3 {
            assert_eq!(p.pump().unwrap(), Pump::Request, "round {round}");
            let mut request = p.take_request();
            assert_eq!(request.method(), "POST");
            assert_eq!(request.read_string().as_deref(), Some("abcdef"));
            assert!(p.keep_alive_allowed());
            p.request_completed();
        }
        assert_eq!(p.pump().unwrap(), Pump::NeedMore);
    }

    #[test]
    fn split_push_equals_single_push() {
        let bytes = b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut p = processor(KeepAlive::Unlimited);

        for chunk in bytes.chunks(3) {
            p.push(chunk);
        }
        while p.pump().unwrap() == Pump::NeedMore {
            // All bytes are queued; one more pump completes the message.
        }
        assert_eq!(p.take_request().url(), b"/x");
    }

    #[test]
    fn limited_policy_counts_down() {
        let request = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut p = processor(KeepAlive::Limited(2));

        p.push(request);
        assert_eq!(p.pump().unwrap(), Pump::Request);
        let decision = p.keep_alive_decision();
        assert!(decision.keep);
        assert_eq!(decision.max_requests, Some(1));
        p.take_request();
        p.request_completed();

        p.push(request);
        assert_eq!(p.pump().unwrap(), Pump::Request);
        let decision = p.keep_alive_decision();
        assert!(!decision.keep);
        assert_eq!(decision.max_requests, Some(0));
    }

    #[test]
    fn connection_close_wins() {
        let mut p = processor(KeepAlive::Unlimited);
        p.push(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert_eq!(p.pump().unwrap(), Pump::Request);
        assert!(!p.keep_alive_allowed());
    }

    #[test]
    fn http_10_defaults_to_close() {
        let mut p = processor(KeepAlive::Unlimited);
        p.push(b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(p.pump().unwrap(), Pump::Request);
        assert!(!p.keep_alive_allowed());

        let mut p = processor(KeepAlive::Unlimited);
        p.push(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(p.pump().unwrap(), Pump::Request);
        assert!(p.keep_alive_allowed());
    }

    #[test]
    fn bad_request_poisons_the_connection() {
        let mut p = processor(KeepAlive::Unlimited);
        p.push(b"GET / HTTP/1.1\r\n\r\nFOO\r\n\r\n");

        assert_eq!(p.pump().unwrap(), Pump::Request);
        assert!(p.keep_alive_allowed());
        p.take_request();
        p.request_completed();

        assert!(p.pump().is_err());
        // Poisoned: no further bytes are accepted or parsed.
        p.push(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(p.pump().unwrap(), Pump::NeedMore);
        assert!(!p.keep_alive_allowed());
    }

    #[test]
    fn disconnect_mid_message_is_unexpected_eof() {
        let mut p = processor(KeepAlive::Unlimited);
        p.push(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab");
        assert_eq!(p.pump().unwrap(), Pump::NeedMore);
        assert_eq!(p.socket_closed(), Some(ParseError::UnexpectedEof));

        // A close between complete requests is an ordinary disconnect.
        let mut p = processor(KeepAlive::Unlimited);
        p.push(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(p.pump().unwrap(), Pump::Request);
        p.take_request();
        p.request_completed();
        assert_eq!(p.socket_closed(), None);
    }

    #[test]
    fn upgrade_request_detected() {
        let mut p = processor(KeepAlive::Unlimited);
        p.push(
            b"GET /chat HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        );
        assert_eq!(p.pump().unwrap(), Pump::Upgrade);
        let request = p.take_request();
        assert_eq!(request.headers().get("Upgrade"), Some("websocket"));
    }

    #[test]
    fn remainder_survives_reset_for_upgrade_takeover() {
        let mut p = processor(KeepAlive::Unlimited);
        p.push(b"GET / HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\nEXTRA");
        assert_eq!(p.pump().unwrap(), Pump::Upgrade);
        assert_eq!(&p.take_retained()[..], b"EXTRA");
    }
}
