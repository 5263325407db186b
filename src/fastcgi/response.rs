//! FastCGI response writer.
//!
//! Body bytes stage in a 64 KiB buffer and leave as STDOUT records. The
//! first write emits the CGI-style header block (`Status:` line, headers,
//! blank line) as its own STDOUT record; `end()` drains the staging
//! buffer, terminates the stream with an empty STDOUT record, closes the
//! request with END_REQUEST(REQUEST_COMPLETE), and finally rejects every
//! multiplexed request id with END_REQUEST(CANT_MPX_CONN).

use crate::{
    errors::RecordError,
    fastcgi::record::{encode_record, ProtocolStatus, Record, RecordType, MAX_CONTENT},
    http::types::{http_date, reason_phrase, Headers},
    stream::Duplex,
};
use std::{io, time::SystemTime};
use tokio::io::AsyncWriteExt;

const STAGING_LIMIT: usize = 64 * 1024;

pub(crate) struct FcgiResponse<'a> {
    stream: &'a mut dyn Duplex,
    request_id: u16,
    extra_request_ids: Vec<u16>,
    status: u16,
    headers: Headers,
    staging: Vec<u8>,
    start_flushed: bool,
    ended: bool,
}

impl<'a> FcgiResponse<'a> {
    pub(crate) fn new(
        stream: &'a mut dyn Duplex,
        request_id: u16,
        extra_request_ids: Vec<u16>,
    ) -> Self {
        let mut headers = Headers::new();
        headers.append("Date", http_date(SystemTime::now()));

        FcgiResponse {
            stream,
            request_id,
            extra_request_ids,
            status: 200,
            headers,
            staging: Vec::with_capacity(STAGING_LIMIT),
            start_flushed: false,
            ended: false,
        }
    }

    pub(crate) fn status(&self) -> u16 {
        self.status
    }

    pub(crate) fn set_status(&mut self, code: u16) {
        if !self.start_flushed {
            self.status = code;
        }
    }

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
        self.flush_start().await?;

        self.staging.extend_from_slice(data);
        if self.staging.len() > STAGING_LIMIT {
            self.flush_staging().await?;
        }
        Ok(())
    }

    pub(crate) async fn end(&mut self) -> io::Result<()> {
        if self.ended {
            return Ok(());
        }
        self.flush_start().await?;
        self.flush_staging().await?;

        // Terminate the output stream, then the request itself.
        self.write_record(encode_record(RecordType::Stdout, self.request_id, b""))
            .await?;
        self.write_record(
            Record::EndRequest {
                request_id: self.request_id,
                app_status: 0,
                protocol_status: ProtocolStatus::RequestComplete,
            }
            .encode(),
        )
        .await?;

        let extras = std::mem::take(&mut self.extra_request_ids);
        for request_id in extras {
            self.write_record(
                Record::EndRequest {
                    request_id,
                    app_status: 0,
                    protocol_status: ProtocolStatus::CantMpxConn,
                }
                .encode(),
            )
            .await?;
        }

        self.stream.flush().await?;
        self.ended = true;
        Ok(())
    }

    /// Emits the CGI header block as the first STDOUT record.
    async fn flush_start(&mut self) -> io::Result<()> {
        if self.start_flushed {
            return Ok(());
        }
        self.start_flushed = true;

        let mut block = Vec::with_capacity(256);
        block.extend_from_slice(
            format!("Status: {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );
        for (name, values) in self.headers.iter() {
            for value in values {
                block.extend_from_slice(name.as_bytes());
                block.extend_from_slice(b": ");
                block.extend_from_slice(value.as_bytes());
                block.extend_from_slice(b"\r\n");
            }
        }
        block.extend_from_slice(b"\r\n");

        for chunk in block.chunks(MAX_CONTENT) {
            self.write_record(encode_record(RecordType::Stdout, self.request_id, chunk))
                .await?;
        }
        Ok(())
    }

    async fn flush_staging(&mut self) -> io::Result<()> {
        let staging = std::mem::take(&mut self.staging);
        for chunk in staging.chunks(MAX_CONTENT) {
            self.write_record(encode_record(RecordType::Stdout, self.request_id, chunk))
                .await?;
        }
        Ok(())
    }

    async fn write_record(&mut self, record: Result<Vec<u8>, RecordError>) -> io::Result<()> {
        let record = record.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.stream.write_all(&record).await
    }
}

/// Answers a BEGIN_REQUEST for a role this engine does not implement.
/// Written bare, with no STDOUT stream around it.
pub(crate) async fn reject_unsupported_role(
    stream: &mut dyn Duplex,
    request_id: u16,
) -> io::Result<()> {
    let record = Record::EndRequest {
        request_id,
        app_status: 0,
        protocol_status: ProtocolStatus::UnknownRole,
    }
    .encode()
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    stream.write_all(&record).await?;
    stream.flush().await
}
