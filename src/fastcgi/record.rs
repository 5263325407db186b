//! FastCGI record codec: wire format in, wire format out.
//!
//! Every record is an 8-byte header (version, type, big-endian request id,
//! big-endian content length, padding length, reserved byte) followed by
//! content and padding; content plus padding is a multiple of 8 bytes.
//! Only the responder-role subset of FastCGI 1.0 is spoken here.

use crate::errors::RecordError;

pub(crate) const FCGI_VERSION_1: u8 = 1;
pub(crate) const HEADER_LEN: usize = 8;
/// Largest content a single record can carry.
pub(crate) const MAX_CONTENT: usize = 0xffff;

/// Record types this engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Opens a request and names its role.
    BeginRequest = 1,
    /// Closes a request with application and protocol status.
    EndRequest = 3,
    /// CGI parameter stream; an empty record ends it.
    Params = 4,
    /// Request body stream; an empty record ends it.
    Stdin = 5,
    /// Response body stream; an empty record ends it.
    Stdout = 6,
}

impl RecordType {
    fn from_u8(value: u8) -> Result<Self, RecordError> {
        match value {
            1 => Ok(RecordType::BeginRequest),
            3 => Ok(RecordType::EndRequest),
            4 => Ok(RecordType::Params),
            5 => Ok(RecordType::Stdin),
            6 => Ok(RecordType::Stdout),
            other => Err(RecordError::InvalidType(other)),
        }
    }
}

/// FastCGI application roles. Only the responder is implemented; the
/// parser rejects the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    /// Handles a request and produces the response.
    Responder = 1,
}

impl Role {
    fn from_u16(value: u16) -> Result<Self, RecordError> {
        match value {
            1 => Ok(Role::Responder),
            other => Err(RecordError::UnsupportedRole(other)),
        }
    }
}

/// END_REQUEST protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// Request ran to completion.
    RequestComplete = 0,
    /// Connection multiplexing refused.
    CantMpxConn = 1,
    /// Role not supported.
    UnknownRole = 3,
}

impl ProtocolStatus {
    fn from_u8(value: u8) -> Result<Self, RecordError> {
        match value {
            0 => Ok(ProtocolStatus::RequestComplete),
            1 => Ok(ProtocolStatus::CantMpxConn),
            3 => Ok(ProtocolStatus::UnknownRole),
            other => Err(RecordError::InvalidSubType(other)),
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// BEGIN_REQUEST: role plus flags (bit 0 is the keep-connection flag).
    BeginRequest {
        request_id: u16,
        role: Role,
        flags: u8,
    },
    /// END_REQUEST: application exit status plus protocol status.
    EndRequest {
        request_id: u16,
        app_status: u32,
        protocol_status: ProtocolStatus,
    },
    /// PARAMS: decoded name/value pairs; empty means end of parameters.
    Params {
        request_id: u16,
        params: Vec<(Vec<u8>, Vec<u8>)>,
    },
    /// STDIN: body bytes; empty means end of body.
    Stdin { request_id: u16, data: Vec<u8> },
    /// STDOUT: response bytes; empty means end of output.
    Stdout { request_id: u16, data: Vec<u8> },
}

impl Record {
    /// The request id this record belongs to.
    pub fn request_id(&self) -> u16 {
        match *self {
            Record::BeginRequest { request_id, .. }
            | Record::EndRequest { request_id, .. }
            | Record::Params { request_id, .. }
            | Record::Stdin { request_id, .. }
            | Record::Stdout { request_id, .. } => request_id,
        }
    }

    /// Decodes one record from the front of `buf`. Returns the record and
    /// the number of bytes consumed; the suffix belongs to the next
    /// record. [`RecordError::BufferExhausted`] means feed more bytes and
    /// retry.
    pub fn parse(buf: &[u8]) -> Result<(Record, usize), RecordError> {
        if buf.len() < HEADER_LEN {
            return Err(RecordError::BufferExhausted);
        }
        if buf[0] != FCGI_VERSION_1 {
            return Err(RecordError::InvalidVersion(buf[0]));
        }
        let record_type = RecordType::from_u8(buf[1])?;
        let request_id = u16::from_be_bytes([buf[2], buf[3]]);
        let content_length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let padding_length = buf[6] as usize;

        let total = HEADER_LEN + content_length + padding_length;
        if buf.len() < total {
            return Err(RecordError::BufferExhausted);
        }
        if request_id == 0 {
            return Err(RecordError::InvalidRequestId);
        }
        let content = &buf[HEADER_LEN..HEADER_LEN + content_length];

        let record = match record_type {
            RecordType::BeginRequest => {
                if content.len() < 8 {
                    return Err(RecordError::Protocol);
                }
                Record::BeginRequest {
                    request_id,
                    role: Role::from_u16(u16::from_be_bytes([content[0], content[1]]))?,
                    flags: content[2],
                }
            }
            RecordType::EndRequest => {
                if content.len() < 8 {
                    return Err(RecordError::Protocol);
                }
                Record::EndRequest {
                    request_id,
                    app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
                    protocol_status: ProtocolStatus::from_u8(content[4])?,
                }
            }
            RecordType::Params => Record::Params {
                request_id,
                params: decode_params(content)?,
            },
            RecordType::Stdin => Record::Stdin {
                request_id,
                data: content.to_vec(),
            },
            RecordType::Stdout => Record::Stdout {
                request_id,
                data: content.to_vec(),
            },
        };

        Ok((record, total))
    }

    /// Encodes the record in wire format.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        match self {
            Record::BeginRequest {
                request_id,
                role,
                flags,
            } => {
                let mut content = Vec::with_capacity(8);
                content.extend_from_slice(&(*role as u16).to_be_bytes());
                content.push(*flags);
                content.extend_from_slice(&[0; 5]);
                encode_record(RecordType::BeginRequest, *request_id, &content)
            }
            Record::EndRequest {
                request_id,
                app_status,
                protocol_status,
            } => {
                let mut content = Vec::with_capacity(8);
                content.extend_from_slice(&app_status.to_be_bytes());
                content.push(*protocol_status as u8);
                content.extend_from_slice(&[0; 3]);
                encode_record(RecordType::EndRequest, *request_id, &content)
            }
            Record::Params { request_id, params } => {
                let mut content = Vec::new();
                for (name, value) in params {
                    if name.is_empty() {
                        return Err(RecordError::EmptyParameters);
                    }
                    encode_length(name.len(), &mut content);
                    encode_length(value.len(), &mut content);
                    content.extend_from_slice(name);
                    content.extend_from_slice(value);
                }
                encode_record(RecordType::Params, *request_id, &content)
            }
            Record::Stdin { request_id, data } => {
                encode_record(RecordType::Stdin, *request_id, data)
            }
            Record::Stdout { request_id, data } => {
                encode_record(RecordType::Stdout, *request_id, data)
            }
        }
    }
}

/// Frames `content` as one record of `record_type`.
pub(crate) fn encode_record(
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> Result<Vec<u8>, RecordError> {
    if request_id == 0 {
        return Err(RecordError::InvalidRequestId);
    }
    if content.len() > MAX_CONTENT {
        return Err(RecordError::OversizeData);
    }
    let padding = content.len().wrapping_neg() & 7;

    let mut buf = Vec::with_capacity(HEADER_LEN + content.len() + padding);
    buf.push(FCGI_VERSION_1);
    buf.push(record_type as u8);
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(content.len() as u16).to_be_bytes());
    buf.push(padding as u8);
    buf.push(0);
    buf.extend_from_slice(content);
    buf.extend_from_slice(&[0u8; 7][..padding]);
    Ok(buf)
}

/// PARAMS length field: one byte for 0..=127, otherwise four big-endian
/// bytes with the high bit of the first set (and masked off on decode).
fn encode_length(length: usize, out: &mut Vec<u8>) {
    if length < 128 {
        out.push(length as u8);
    } else {
        out.extend_from_slice(&((length as u32) | (1 << 31)).to_be_bytes());
    }
}

fn decode_length(buf: &[u8]) -> Result<(usize, &[u8]), RecordError> {
    match buf {
        [] => Err(RecordError::Protocol),
        [b, rest @ ..] if *b < 128 => Ok((*b as usize, rest)),
        [b0, b1, b2, b3, rest @ ..] => {
            let length = (((*b0 & 0x7f) as usize) << 24)
                | ((*b1 as usize) << 16)
                | ((*b2 as usize) << 8)
                | (*b3 as usize);
            Ok((length, rest))
        }
        _ => Err(RecordError::Protocol),
    }
}

fn decode_params(mut content: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RecordError> {
    let mut params = Vec::new();
    while !content.is_empty() {
        let (name_len, rest) = decode_length(content)?;
        let (value_len, rest) = decode_length(rest)?;
        if rest.len() < name_len + value_len {
            return Err(RecordError::Protocol);
        }
        if name_len == 0 {
            return Err(RecordError::EmptyParameters);
        }
        params.push((
            rest[..name_len].to_vec(),
            rest[name_len..name_len + value_len].to_vec(),
        ));
        content = &rest[name_len + value_len..];
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(name: &str, value: &str) -> (Vec<u8>, Vec<u8>) {
        (name.as_bytes().to_vec(), value.as_bytes().to_vec())
    }

    #[test]
    fn round_trip_every_type() {
        #[rustfmt::skip]
        let records = [
            Record::BeginRequest { request_id: 42, role: Role::Responder, flags: 0 },
            Record::EndRequest {
                request_id: 42,
                app_status: 7,
                protocol_status: ProtocolStatus::RequestComplete,
            },
            Record::EndRequest {
                request_id: 2,
                app_status: 0,
                protocol_status: ProtocolStatus::CantMpxConn,
            },
            Record::EndRequest {
                request_id: 3,
                app_status: 0,
                protocol_status: ProtocolStatus::UnknownRole,
            },
            Record::Params {
                request_id: 42,
                params: vec![pair("REQUEST_METHOD", "GET"), pair("REQUEST_URI", "/hello")],
            },
            Record::Params { request_id: 42, params: vec![] },
            Record::Stdin { request_id: 42, data: b"quantity=100".to_vec() },
            Record::Stdin { request_id: 42, data: vec![] },
            Record::Stdout { request_id: 42, data: b"Status: 200 OK\r\n\r\n".to_vec() },
        ];

        for record in records {
            let wire = record.encode().unwrap();
            assert_eq!(wire.len() % 8, 0, "{record:?} not 8-byte aligned");

            let (parsed, consumed) = Record::parse(&wire).unwrap();
            assert_eq!(consumed, wire.len());
            assert_eq!(parsed, record);
        }
    }

    #[test]
    fn long_params_use_four_byte_lengths() {
        let record = Record::Params {
            request_id: 1,
            params: vec![pair("X", &"v".repeat(300))],
        };
        let wire = record.encode().unwrap();

        // name length (1 byte), then a 4-byte value length with the high
        // bit set on the first byte.
        assert_eq!(wire[HEADER_LEN], 1);
        assert_eq!(wire[HEADER_LEN + 1], 0x80);
        assert_eq!(
            u32::from_be_bytes([0, wire[HEADER_LEN + 2], wire[HEADER_LEN + 3], wire[HEADER_LEN + 4]]),
            300
        );

        let (parsed, _) = Record::parse(&wire).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn parse_returns_suffix_offset() {
        let mut wire = Record::BeginRequest {
            request_id: 1,
            role: Role::Responder,
            flags: 0,
        }
        .encode()
        .unwrap();
        let first_len = wire.len();
        wire.extend_from_slice(
            &Record::Stdin {
                request_id: 1,
                data: b"abc".to_vec(),
            }
            .encode()
            .unwrap(),
        );

        let (_, consumed) = Record::parse(&wire).unwrap();
        assert_eq!(consumed, first_len);

        let (second, _) = Record::parse(&wire[consumed..]).unwrap();
        assert!(matches!(second, Record::Stdin { .. }));
    }

    #[test]
    fn incomplete_input_asks_for_more() {
        let wire = Record::Stdin {
            request_id: 1,
            data: b"abcdef".to_vec(),
        }
        .encode()
        .unwrap();

        for cut in [0, 4, HEADER_LEN, wire.len() - 1] {
            assert_eq!(
                Record::parse(&wire[..cut]).unwrap_err(),
                RecordError::BufferExhausted,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn encode_rejections() {
        let oversize = Record::Stdout {
            request_id: 1,
            data: vec![0; MAX_CONTENT + 1],
        };
        assert_eq!(oversize.encode().unwrap_err(), RecordError::OversizeData);

        let zero_id = Record::Stdin {
            request_id: 0,
            data: vec![],
        };
        assert_eq!(zero_id.encode().unwrap_err(), RecordError::InvalidRequestId);

        let empty_name = Record::Params {
            request_id: 1,
            params: vec![pair("", "v")],
        };
        assert_eq!(empty_name.encode().unwrap_err(), RecordError::EmptyParameters);
    }

    #[test]
    fn parse_rejections() {
        // Unknown record type 9 (GET_VALUES is outside the responder set).
        let mut unknown = encode_record(RecordType::Stdin, 1, b"").unwrap();
        unknown[1] = 9;
        assert_eq!(Record::parse(&unknown).unwrap_err(), RecordError::InvalidType(9));

        let mut bad_version = encode_record(RecordType::Stdin, 1, b"").unwrap();
        bad_version[0] = 2;
        assert_eq!(
            Record::parse(&bad_version).unwrap_err(),
            RecordError::InvalidVersion(2)
        );

        let mut authorizer = Record::BeginRequest {
            request_id: 1,
            role: Role::Responder,
            flags: 0,
        }
        .encode()
        .unwrap();
        authorizer[HEADER_LEN + 1] = 2;
        assert_eq!(
            Record::parse(&authorizer).unwrap_err(),
            RecordError::UnsupportedRole(2)
        );

        let empty_name = encode_record(RecordType::Params, 1, &[0, 1, b'v']).unwrap();
        assert_eq!(
            Record::parse(&empty_name).unwrap_err(),
            RecordError::EmptyParameters
        );
    }
}
