//! Incremental HTTP/1.1 request parser.
//!
//! A push parser: bytes go in via [`HttpParser::execute`] in whatever
//! chunks the socket produces, events come out through a [`ParseSink`].
//! One call consumes at most one complete message; the return value says
//! how many bytes were taken, and any suffix belongs to the next message
//! (the pipelining contract). Feeding the same bytes in different splits
//! produces the same event sequence.

use crate::{errors::ParseError, http::types::Version};
use memchr::memchr;

/// Longest accepted request/header/chunk-size line.
const MAX_LINE: usize = 16 * 1024;
/// Most header lines accepted per message.
const MAX_HEADERS: usize = 128;

/// Receives parse events in protocol order: message-begin, url, header
/// field/value pairs, headers-complete, body chunks, message-complete.
pub(crate) trait ParseSink {
    fn on_message_begin(&mut self) {}
    fn on_url(&mut self, _chunk: &[u8]) {}
    fn on_header_field(&mut self, _chunk: &[u8]) {}
    fn on_header_value(&mut self, _chunk: &[u8]) {}
    fn on_headers_complete(&mut self, _method: &str, _version: Version) {}
    fn on_body(&mut self, _chunk: &[u8]) {}
    fn on_message_complete(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    HeaderLine,
    FixedBody,
    ChunkSize,
    ChunkData,
    ChunkDataEnd,
    Trailer,
    Complete,
}

/// Connection-scoped parser state. Reset between keep-alive requests.
#[derive(Debug)]
pub(crate) struct HttpParser {
    state: State,
    line: Vec<u8>,
    method: String,
    version: Version,
    header_count: usize,
    content_length: Option<u64>,
    chunked: bool,
    body_left: u64,
}

impl HttpParser {
    pub(crate) fn new() -> Self {
        HttpParser {
            state: State::RequestLine,
            line: Vec::new(),
            method: String::new(),
            version: Version::HTTP_11,
            header_count: 0,
            content_length: None,
            chunked: false,
            body_left: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = State::RequestLine;
        self.line.clear();
        self.method.clear();
        self.version = Version::HTTP_11;
        self.header_count = 0;
        self.content_length = None;
        self.chunked = false;
        self.body_left = 0;
    }

    /// True once the current message has been fully delivered.
    pub(crate) fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// True while a message is partially parsed (for EOF classification).
    pub(crate) fn is_mid_message(&self) -> bool {
        self.state != State::RequestLine && self.state != State::Complete
    }

    /// Feeds `data`, emitting events into `sink`. Returns the number of
    /// bytes consumed; bytes past a completed message are left untouched.
    pub(crate) fn execute(
        &mut self,
        data: &[u8],
        sink: &mut impl ParseSink,
    ) -> Result<usize, ParseError> {
        let mut pos = 0;

        while pos < data.len() {
            match self.state {
                State::Complete => break,

                State::FixedBody => {
                    let take = (self.body_left as usize).min(data.len() - pos);
                    sink.on_body(&data[pos..pos + take]);
                    self.body_left -= take as u64;
                    pos += take;
                    if self.body_left == 0 {
                        self.state = State::Complete;
                        sink.on_message_complete();
                    }
                }

                State::ChunkData => {
                    let take = (self.body_left as usize).min(data.len() - pos);
                    sink.on_body(&data[pos..pos + take]);
                    self.body_left -= take as u64;
                    pos += take;
                    if self.body_left == 0 {
                        self.state = State::ChunkDataEnd;
                    }
                }

                _ => {
                    let Some(nl) = memchr(b'\n', &data[pos..]) else {
                        if self.line.len() + (data.len() - pos) > MAX_LINE {
                            return Err(ParseError::Protocol("line too long"));
                        }
                        self.line.extend_from_slice(&data[pos..]);
                        return Ok(data.len());
                    };

                    if self.line.len() + nl > MAX_LINE {
                        return Err(ParseError::Protocol("line too long"));
                    }
                    self.line.extend_from_slice(&data[pos..pos + nl]);
                    if self.line.last() == Some(&b'\r') {
                        self.line.pop();
                    }
                    pos += nl + 1;

                    let line = std::mem::take(&mut self.line);
                    self.consume_line(&line, sink)?;
                }
            }
        }

        Ok(pos)
    }

    fn consume_line(&mut self, line: &[u8], sink: &mut impl ParseSink) -> Result<(), ParseError> {
        match self.state {
            State::RequestLine => self.request_line(line, sink),
            State::HeaderLine => self.header_line(line, sink),
            State::ChunkSize => self.chunk_size_line(line),
            State::ChunkDataEnd => {
                if !line.is_empty() {
                    return Err(ParseError::Protocol("bad chunk framing"));
                }
                self.state = State::ChunkSize;
                Ok(())
            }
            State::Trailer => {
                if line.is_empty() {
                    self.state = State::Complete;
                    sink.on_message_complete();
                }
                Ok(())
            }
            // Body and Complete states never reach line handling.
            _ => Err(ParseError::Internal),
        }
    }

    fn request_line(&mut self, line: &[u8], sink: &mut impl ParseSink) -> Result<(), ParseError> {
        // Tolerate blank lines before the request line (RFC 7230 §3.5).
        if line.is_empty() {
            return Ok(());
        }

        sink.on_message_begin();

        let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
        let method = parts.next().ok_or(ParseError::Protocol("missing method"))?;
        let target = parts.next().ok_or(ParseError::Protocol("missing target"))?;
        let version = parts.next().ok_or(ParseError::Protocol("missing version"))?;
        if parts.next().is_some() {
            return Err(ParseError::Protocol("malformed request line"));
        }

        if method.is_empty() || !method.iter().all(|&b| is_token_byte(b)) {
            return Err(ParseError::Protocol("invalid method"));
        }
        self.method = String::from_utf8(method.to_vec()).map_err(|_| ParseError::Internal)?;
        self.version = parse_version(version)?;

        sink.on_url(target);

        self.header_count = 0;
        self.content_length = None;
        self.chunked = false;
        self.state = State::HeaderLine;
        Ok(())
    }

    fn header_line(&mut self, line: &[u8], sink: &mut impl ParseSink) -> Result<(), ParseError> {
        if line.is_empty() {
            sink.on_headers_complete(&self.method, self.version);

            if self.chunked {
                self.state = State::ChunkSize;
            } else if let Some(length) = self.content_length.filter(|&l| l > 0) {
                self.body_left = length;
                self.state = State::FixedBody;
            } else {
                self.state = State::Complete;
                sink.on_message_complete();
            }
            return Ok(());
        }

        self.header_count += 1;
        if self.header_count > MAX_HEADERS {
            return Err(ParseError::Protocol("too many headers"));
        }

        let colon = memchr(b':', line).ok_or(ParseError::Protocol("header without colon"))?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&b| is_token_byte(b)) {
            return Err(ParseError::Protocol("invalid header name"));
        }
        let value = trim_ows(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"content-length") {
            let parsed = ascii_to_u64(value).ok_or(ParseError::Protocol("invalid content-length"))?;
            if self.content_length.is_some_and(|prev| prev != parsed) {
                return Err(ParseError::Protocol("conflicting content-length"));
            }
            self.content_length = Some(parsed);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding")
            && value
                .split(|&b| b == b',')
                .any(|t| trim_ows(t).eq_ignore_ascii_case(b"chunked"))
        {
            self.chunked = true;
        }

        sink.on_header_field(name);
        sink.on_header_value(value);
        Ok(())
    }

    fn chunk_size_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let digits = match memchr(b';', line) {
            Some(semi) => &line[..semi],
            None => line,
        };
        let digits = trim_ows(digits);
        if digits.is_empty() {
            return Err(ParseError::Protocol("missing chunk size"));
        }

        let mut size: u64 = 0;
        for &b in digits {
            let digit = (b as char)
                .to_digit(16)
                .ok_or(ParseError::Protocol("invalid chunk size"))?;
            size = size
                .checked_mul(16)
                .and_then(|s| s.checked_add(u64::from(digit)))
                .ok_or(ParseError::Protocol("chunk size overflow"))?;
        }

        if size == 0 {
            self.state = State::Trailer;
        } else {
            self.body_left = size;
            self.state = State::ChunkData;
        }
        Ok(())
    }
}

fn parse_version(bytes: &[u8]) -> Result<Version, ParseError> {
    match bytes {
        b"HTTP/1.1" => Ok(Version::HTTP_11),
        b"HTTP/1.0" => Ok(Version::HTTP_10),
        _ => Err(ParseError::Protocol("unsupported HTTP version")),
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

fn ascii_to_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }
    let mut result: u64 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        result = result
            .checked_mul(10)?
            .checked_add(u64::from(b - b'0'))?;
    }
    Some(result)
}
