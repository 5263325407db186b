//! Buffered HTTP/1.1 response writer.
//!
//! One writer produces exactly one response. The first byte of body (or
//! `end`) flushes the status line and headers; from then on status and
//! headers are frozen and attempts to change them change nothing.

use crate::{
    http::types::{http_date, reason_phrase, Headers},
    stream::Duplex,
};
use std::{io, time::SystemTime};
use tokio::io::AsyncWriteExt;

/// Small writes are staged here; anything that would overflow goes to the
/// socket directly.
const BUFFER_LIMIT: usize = 2000;

/// The processor's final word on connection reuse, snapshotted when the
/// writer is created (nothing can change it afterwards: the next request
/// is not parsed until this response has ended).
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeepAliveDecision {
    /// Reuse the connection after this response.
    pub(crate) keep: bool,
    /// Advertised `Keep-Alive: timeout=` seconds.
    pub(crate) idle_secs: u64,
    /// Advertised `Keep-Alive: max=`; `None` under an unlimited policy.
    pub(crate) max_requests: Option<u32>,
}

impl KeepAliveDecision {
    pub(crate) fn close() -> Self {
        KeepAliveDecision {
            keep: false,
            idle_secs: 0,
            max_requests: None,
        }
    }
}

pub(crate) struct HttpResponse<'a> {
    stream: &'a mut dyn Duplex,
    status: u16,
    headers: Headers,
    buffer: Vec<u8>,
    keep_alive: KeepAliveDecision,
    start_flushed: bool,
    ended: bool,
}

impl<'a> HttpResponse<'a> {
    pub(crate) fn new(stream: &'a mut dyn Duplex, keep_alive: KeepAliveDecision) -> Self {
        let mut headers = Headers::new();
        headers.append("Date", http_date(SystemTime::now()));

        HttpResponse {
            stream,
            status: 200,
            headers,
            buffer: Vec::with_capacity(BUFFER_LIMIT),
            keep_alive,
            start_flushed: false,
            ended: false,
        }
    }

    pub(crate) fn status(&self) -> u16 {
        self.status
    }

    /// No effect once the header block has been flushed.
    pub(crate) fn set_status(&mut self, code: u16) {
        if !self.start_flushed {
            self.status = code;
        }
    }

    /// Mutations after the header block has been flushed change nothing
    /// on the wire.
    pub(crate) fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub(crate) fn ended(&self) -> bool {
        self.ended
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.ended {
            return Ok(());
        }
        self.start_flush();

        if self.buffer.len() + data.len() > BUFFER_LIMIT && !self.buffer.is_empty() {
            self.flush_buffer().await?;
        }
        if data.len() > BUFFER_LIMIT {
            self.stream.write_all(data).await
        } else {
            self.buffer.extend_from_slice(data);
            Ok(())
        }
    }

    pub(crate) async fn end(&mut self) -> io::Result<()> {
        if self.ended {
            return Ok(());
        }
        self.start_flush();
        self.flush_buffer().await?;
        self.stream.flush().await?;
        self.ended = true;
        Ok(())
    }

    /// Stages the status line and header block. One-shot: status and
    /// headers are immutable from here on.
    fn start_flush(&mut self) {
        if self.start_flushed {
            return;
        }
        self.start_flushed = true;

        self.buffer.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );

        // A 101 hands the connection header to the upgrade factory.
        if self.status != 101 {
            if self.keep_alive.keep {
                self.buffer.extend_from_slice(b"Connection: Keep-Alive\r\n");
                match self.keep_alive.max_requests {
                    Some(max) => self.buffer.extend_from_slice(
                        format!("Keep-Alive: timeout={}, max={max}\r\n", self.keep_alive.idle_secs)
                            .as_bytes(),
                    ),
                    None => self.buffer.extend_from_slice(
                        format!("Keep-Alive: timeout={}\r\n", self.keep_alive.idle_secs).as_bytes(),
                    ),
                }
            } else {
                self.buffer.extend_from_slice(b"Connection: Close\r\n");
            }
        }

        for (name, values) in self.headers.iter() {
            for value in values {
                self.buffer.extend_from_slice(name.as_bytes());
                self.buffer.extend_from_slice(b": ");
                self.buffer.extend_from_slice(value.as_bytes());
                self.buffer.extend_from_slice(b"\r\n");
            }
        }
        self.buffer.extend_from_slice(b"\r\n");
    }

    async fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.stream.write_all(&self.buffer).await?;
            self.buffer.clear();
        }
        Ok(())
    }
}
