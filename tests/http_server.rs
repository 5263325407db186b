//! End-to-end HTTP tests over real sockets.

use harbor_net::{
    ConnectionPolicy, Endpoint, KeepAlive, Server, ServerDelegate, ServerRequest, ServerResponse,
};
use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::sleep,
};

/// Echoes how many body bytes arrived; counts invocations.
struct CountingDelegate {
    calls: Arc<AtomicUsize>,
}

impl ServerDelegate for CountingDelegate {
    async fn handle(
        &self,
        request: &mut ServerRequest,
        response: &mut ServerResponse<'_>,
    ) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut body = Vec::new();
        let n = request.read_all(&mut body);
        response.headers_mut().append("Content-Type", "text/plain");

        if request.method() == "HEAD" {
            response
                .headers_mut()
                .append("Content-Length", "0".to_string());
            response.end().await
        } else {
            let text = format!("Read {n} bytes");
            response
                .headers_mut()
                .append("Content-Length", text.len().to_string());
            response.end_with(text).await
        }
    }
}

async fn start_server(
    keep_alive: KeepAlive,
    max_connections: Option<usize>,
) -> (
    Server<CountingDelegate>,
    u16,
    Arc<AtomicUsize>,
) {
    let calls = Arc::new(AtomicUsize::new(0));
    let server = Server::builder()
        .endpoint(Endpoint::tcp(0))
        .delegate(CountingDelegate {
            calls: calls.clone(),
        })
        .keep_alive(keep_alive)
        .connection_policy(ConnectionPolicy { max_connections })
        .build();
    server.listen().await.unwrap();
    let port = server.port().unwrap();
    (server, port, calls)
}

/// Minimal response reader: status code, lowercase header map, body.
struct ResponseReader {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl ResponseReader {
    fn new(stream: TcpStream) -> Self {
        ResponseReader {
            stream,
            buf: Vec::new(),
        }
    }

    async fn read_response(&mut self) -> Option<(u16, HashMap<String, String>, Vec<u8>)> {
        loop {
            if let Some(header_end) = find(&self.buf, b"\r\n\r\n") {
                let header_text = String::from_utf8(self.buf[..header_end].to_vec()).unwrap();
                let mut lines = header_text.split("\r\n");
                let status: u16 = lines.next().unwrap().split(' ').nth(1).unwrap().parse().unwrap();
                let headers: HashMap<String, String> = lines
                    .filter_map(|l| l.split_once(": "))
                    .map(|(n, v)| (n.to_ascii_lowercase(), v.to_string()))
                    .collect();

                let body_len: usize = headers
                    .get("content-length")
                    .map(|v| v.parse().unwrap())
                    .unwrap_or(0);
                let total = header_end + 4 + body_len;
                if self.buf.len() >= total {
                    let body = self.buf[header_end + 4..total].to_vec();
                    self.buf.drain(..total);
                    return Some((status, headers, body));
                }
            }

            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    async fn expect_eof(&mut self) {
        let mut chunk = [0u8; 64];
        assert_eq!(self.stream.read(&mut chunk).await.unwrap_or(0), 0);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

const POST: &[u8] = b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 6\r\n\r\nabcdef";

#[tokio::test]
async fn pipelined_requests_answered_in_order() {
    let (_server, port, calls) = start_server(KeepAlive::Unlimited, None).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&POST.repeat(3)).await.unwrap();

    let mut reader = ResponseReader::new(stream);
    for _ in 0..3 {
        let (status, headers, body) = reader.read_response().await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"Read 6 bytes");
        assert_eq!(headers.get("connection").map(String::as_str), Some("Keep-Alive"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn pipelining_across_packet_boundaries() {
    let (_server, port, _calls) = start_server(KeepAlive::Unlimited, None).await;

    let bytes = POST.repeat(3);
    let len = POST.len();
    // req1 + half of req2 | rest of req2 + 8 bytes of req3 | rest of req3
    let splits = [len + len / 2, 2 * len + 8, 3 * len];

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut sent = 0;
    for split in splits {
        stream.write_all(&bytes[sent..split]).await.unwrap();
        stream.flush().await.unwrap();
        sent = split;
        sleep(Duration::from_millis(30)).await;
    }

    let mut reader = ResponseReader::new(stream);
    for _ in 0..3 {
        let (status, _, body) = reader.read_response().await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"Read 6 bytes");
    }
}

#[tokio::test]
async fn bad_request_after_good_request() {
    let (_server, port, calls) = start_server(KeepAlive::Unlimited, None).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\nFOO\r\n")
        .await
        .unwrap();

    let mut reader = ResponseReader::new(stream);

    let (status, headers, _) = reader.read_response().await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(headers.get("connection").map(String::as_str), Some("Keep-Alive"));

    let (status, headers, body) = reader.read_response().await.unwrap();
    assert_eq!(status, 400);
    assert_eq!(headers.get("connection").map(String::as_str), Some("Close"));
    assert!(body.is_empty());

    reader.expect_eof().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn head_request_has_empty_body() {
    let (_server, port, _calls) = start_server(KeepAlive::Unlimited, None).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"HEAD /headtest HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();

    let mut reader = ResponseReader::new(stream);
    let (status, headers, body) = reader.read_response().await.unwrap();
    assert_eq!(status, 200);
    assert!(body.is_empty());
    assert_eq!(headers.get("content-length").map(String::as_str), Some("0"));
}

#[tokio::test]
async fn limited_keep_alive_serves_exactly_n_requests() {
    let (_server, port, calls) = start_server(KeepAlive::Limited(2), None).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&POST.repeat(3)).await.unwrap();

    let mut reader = ResponseReader::new(stream);

    let (status, headers, _) = reader.read_response().await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(headers.get("connection").map(String::as_str), Some("Keep-Alive"));
    assert_eq!(
        headers.get("keep-alive").map(String::as_str),
        Some("timeout=60, max=1")
    );

    let (status, headers, _) = reader.read_response().await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(headers.get("connection").map(String::as_str), Some("Close"));

    // The third pipelined request never reaches the delegate.
    reader.expect_eof().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn connection_close_is_honored() {
    let (_server, port, _calls) = start_server(KeepAlive::Unlimited, None).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut reader = ResponseReader::new(stream);
    let (status, headers, _) = reader.read_response().await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(headers.get("connection").map(String::as_str), Some("Close"));
    reader.expect_eof().await;
}

#[tokio::test]
async fn over_capacity_connection_receives_503() {
    let (_server, port, calls) = start_server(KeepAlive::Unlimited, Some(1)).await;

    // First connection completes a request and stays registered.
    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    first.write_all(POST).await.unwrap();
    let mut first = ResponseReader::new(first);
    assert_eq!(first.read_response().await.unwrap().0, 200);

    // Second connection is over the limit.
    let second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut second = ResponseReader::new(second);
    let (status, headers, body) = second.read_response().await.unwrap();
    assert_eq!(status, 503);
    assert_eq!(headers.get("connection").map(String::as_str), Some("Close"));
    assert!(body.is_empty());
    second.expect_eof().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn port_zero_is_discoverable_and_stop_closes() {
    let (server, port, _calls) = start_server(KeepAlive::Unlimited, None).await;
    assert_ne!(port, 0);

    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();
    // Catch-up: the server already started, so this fires immediately.
    server.on_started(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(started.load(Ordering::SeqCst), 1);

    let counter = stopped.clone();
    server.on_stopped(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(POST).await.unwrap();
    let mut reader = ResponseReader::new(stream);
    assert_eq!(reader.read_response().await.unwrap().0, 200);

    server.stop();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);

    // The live keep-alive connection is torn down.
    reader.expect_eof().await;
}
