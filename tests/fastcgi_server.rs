//! End-to-end FastCGI responder tests over real sockets.

use harbor_net::{
    Endpoint, Protocol, ProtocolStatus, Record, Role, Server, ServerDelegate, ServerRequest,
    ServerResponse,
};
use std::io;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

struct OkDelegate;

impl ServerDelegate for OkDelegate {
    async fn handle(
        &self,
        request: &mut ServerRequest,
        response: &mut ServerResponse<'_>,
    ) -> io::Result<()> {
        assert_eq!(request.method(), "GET");
        response.headers_mut().append("Content-Type", "text/plain");
        response.end_with("OK").await
    }
}

async fn start_server() -> (Server<OkDelegate>, u16) {
    let server = Server::builder()
        .endpoint(Endpoint::tcp(0))
        .protocol(Protocol::FastCgi)
        .delegate(OkDelegate)
        .build();
    server.listen().await.unwrap();
    let port = server.port().unwrap();
    (server, port)
}

fn begin(id: u16) -> Vec<u8> {
    Record::BeginRequest {
        request_id: id,
        role: Role::Responder,
        flags: 0,
    }
    .encode()
    .unwrap()
}

fn params(id: u16, pairs: &[(&str, &str)]) -> Vec<u8> {
    Record::Params {
        request_id: id,
        params: pairs
            .iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect(),
    }
    .encode()
    .unwrap()
}

fn stdin(id: u16, data: &[u8]) -> Vec<u8> {
    Record::Stdin {
        request_id: id,
        data: data.to_vec(),
    }
    .encode()
    .unwrap()
}

/// Reads to EOF and decodes the record stream.
async fn read_records(mut stream: TcpStream) -> Vec<Record> {
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).await.unwrap();

    let mut records = Vec::new();
    let mut rest = &wire[..];
    while !rest.is_empty() {
        let (record, consumed) = Record::parse(rest).unwrap();
        records.push(record);
        rest = &rest[consumed..];
    }
    records
}

fn stdout_text(records: &[Record]) -> String {
    let mut text = Vec::new();
    for record in records {
        if let Record::Stdout { data, .. } = record {
            text.extend_from_slice(data);
        }
    }
    String::from_utf8(text).unwrap()
}

#[tokio::test]
async fn simple_responder_request() {
    let (_server, port) = start_server().await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&begin(42)).await.unwrap();
    stream
        .write_all(&params(
            42,
            &[
                ("REQUEST_METHOD", "GET"),
                ("REQUEST_URI", "/hello"),
                ("SERVER_PROTOCOL", "HTTP/1.1"),
            ],
        ))
        .await
        .unwrap();
    stream.write_all(&params(42, &[])).await.unwrap();
    stream.write_all(&stdin(42, b"")).await.unwrap();

    let records = read_records(stream).await;

    let text = stdout_text(&records);
    assert!(text.starts_with("Status: 200 OK\r\n"), "{text}");
    assert!(text.contains("Content-Type: text/plain\r\n"));
    assert!(text.ends_with("\r\n\r\nOK"), "{text}");

    // Every record belongs to request 42; the stream ends with an empty
    // STDOUT and END_REQUEST(REQUEST_COMPLETE).
    assert!(records.iter().all(|r| r.request_id() == 42));
    let n = records.len();
    assert!(matches!(
        &records[n - 2],
        Record::Stdout { data, .. } if data.is_empty()
    ));
    assert_eq!(
        records[n - 1],
        Record::EndRequest {
            request_id: 42,
            app_status: 0,
            protocol_status: ProtocolStatus::RequestComplete,
        }
    );
}

#[tokio::test]
async fn multiplex_attempt_is_rejected_per_extra_id() {
    let (_server, port) = start_server().await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&begin(1)).await.unwrap();
    stream.write_all(&begin(2)).await.unwrap();
    stream
        .write_all(&params(1, &[("REQUEST_METHOD", "GET")]))
        .await
        .unwrap();
    stream.write_all(&params(1, &[])).await.unwrap();
    stream.write_all(&stdin(1, b"")).await.unwrap();

    let records = read_records(stream).await;

    // Normal response for id 1 first, then the rejection for id 2.
    let n = records.len();
    assert_eq!(
        records[n - 2],
        Record::EndRequest {
            request_id: 1,
            app_status: 0,
            protocol_status: ProtocolStatus::RequestComplete,
        }
    );
    assert_eq!(
        records[n - 1],
        Record::EndRequest {
            request_id: 2,
            app_status: 0,
            protocol_status: ProtocolStatus::CantMpxConn,
        }
    );
}

#[tokio::test]
async fn non_responder_role_gets_unknown_role() {
    let (_server, port) = start_server().await;

    // BEGIN_REQUEST for the authorizer role, hand-framed.
    let mut wire = begin(9);
    wire[9] = 2;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&wire).await.unwrap();

    let records = read_records(stream).await;
    assert_eq!(
        records,
        [Record::EndRequest {
            request_id: 9,
            app_status: 0,
            protocol_status: ProtocolStatus::UnknownRole,
        }]
    );
}

#[tokio::test]
async fn records_split_across_writes() {
    let (_server, port) = start_server().await;

    let mut bytes = begin(7);
    bytes.extend(params(7, &[("REQUEST_METHOD", "GET"), ("REQUEST_URI", "/x")]));
    bytes.extend(params(7, &[]));
    bytes.extend(stdin(7, b""));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    for chunk in bytes.chunks(5) {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
    }

    let records = read_records(stream).await;
    assert!(stdout_text(&records).ends_with("OK"));
    assert_eq!(
        records.last().unwrap(),
        &Record::EndRequest {
            request_id: 7,
            app_status: 0,
            protocol_status: ProtocolStatus::RequestComplete,
        }
    );
}

#[cfg(unix)]
#[tokio::test]
async fn responder_over_unix_socket() {
    let path = std::env::temp_dir().join("harbor_net_fcgi_test.sock");
    let _ = std::fs::remove_file(&path);

    let server = Server::builder()
        .endpoint(Endpoint::unix(&path))
        .protocol(Protocol::FastCgi)
        .delegate(OkDelegate)
        .build();
    server.listen().await.unwrap();

    let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
    stream.write_all(&begin(3)).await.unwrap();
    stream
        .write_all(&params(3, &[("REQUEST_METHOD", "GET")]))
        .await
        .unwrap();
    stream.write_all(&params(3, &[])).await.unwrap();
    stream.write_all(&stdin(3, b"")).await.unwrap();

    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).await.unwrap();

    let mut records = Vec::new();
    let mut rest = &wire[..];
    while !rest.is_empty() {
        let (record, consumed) = Record::parse(rest).unwrap();
        records.push(record);
        rest = &rest[consumed..];
    }

    assert!(stdout_text(&records).ends_with("OK"));
    let _ = std::fs::remove_file(&path);
}
