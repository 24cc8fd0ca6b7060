//! In-memory transport and a line-oriented codec for tests.
//!
//! [`MockTransport`] answers connects from a per-address script (accept,
//! refuse, hang, accept after a delay) and hands the server end of every
//! accepted stream to a [`MockListener`]. [`MockCodec`] speaks a trivial
//! line protocol so tests can drive the connection state machine (heads,
//! payload chunks, interim continues, close indicators) without an HTTP
//! parser in the loop.
//!
//! Request wire form: `REQ {method} {target} {authority} len={n|chunked}
//! expect={0|1}`, payload as `DATA {n}` followed by the raw bytes, ended
//! by `DONE`. Response lines: `100`, `HEAD {status} {close|keep} [k=v
//! ...]`, `BODY {text}`, `END`.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use crate::codec::{CodecError, CodecFactory, DecodeEvent, HttpCodec, RequestHead, ResponseHead};
use crate::transport::{BoxIo, Transport};
use crate::BoxFuture;

/// How the transport answers a connect to one address.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Accept immediately.
    Accept,
    /// Accept after a delay.
    AcceptAfter(Duration),
    /// Fail with `ConnectionRefused`.
    Refuse,
    /// Never complete.
    Hang,
}

struct MockNet {
    scripts: Mutex<HashMap<IpAddr, Script>>,
    dials: Mutex<HashMap<IpAddr, usize>>,
    accepts: mpsc::UnboundedSender<ServerConn>,
}

/// In-memory transport with scriptable connect behavior.
#[derive(Clone)]
pub struct MockTransport {
    net: Arc<MockNet>,
}

impl MockTransport {
    /// Create a transport and the listener receiving its accepted streams.
    pub fn new() -> (Self, MockListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                net: Arc::new(MockNet {
                    scripts: Mutex::new(HashMap::new()),
                    dials: Mutex::new(HashMap::new()),
                    accepts: tx,
                }),
            },
            MockListener { rx },
        )
    }

    /// Script connects to `ip`. Unscripted addresses accept.
    pub fn script(&self, ip: IpAddr, script: Script) {
        self.net.scripts.lock().insert(ip, script);
    }

    /// How many connects were attempted against `ip`.
    pub fn dials(&self, ip: IpAddr) -> usize {
        self.net.dials.lock().get(&ip).copied().unwrap_or(0)
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport").finish_non_exhaustive()
    }
}

impl Transport for MockTransport {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, Result<BoxIo, io::Error>> {
        let net = self.net.clone();
        *net.dials.lock().entry(addr.ip()).or_insert(0) += 1;
        let script = net
            .scripts
            .lock()
            .get(&addr.ip())
            .copied()
            .unwrap_or(Script::Accept);

        Box::pin(async move {
            match script {
                Script::Refuse => Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )),
                Script::Hang => {
                    futures_util::future::pending::<()>().await;
                    unreachable!("pending future completed")
                }
                Script::AcceptAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    accept(&net, addr)
                }
                Script::Accept => accept(&net, addr),
            }
        })
    }
}

fn accept(net: &MockNet, addr: SocketAddr) -> Result<BoxIo, io::Error> {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(server);
    net.accepts
        .send(ServerConn {
            addr,
            reader: BufReader::new(read),
            writer: write,
        })
        .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener dropped"))?;
    Ok(Box::new(client))
}

/// Receives the server end of every accepted connection.
#[derive(Debug)]
pub struct MockListener {
    rx: mpsc::UnboundedReceiver<ServerConn>,
}

impl MockListener {
    /// The next accepted connection.
    pub async fn accept(&mut self) -> ServerConn {
        self.rx.recv().await.expect("mock transport dropped")
    }
}

/// The server end of one accepted stream, with helpers for the mock wire
/// form.
pub struct ServerConn {
    addr: SocketAddr,
    reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
    writer: tokio::io::WriteHalf<DuplexStream>,
}

/// A parsed `REQ` line.
#[derive(Debug)]
pub struct MockRequest {
    /// Request method.
    pub method: String,
    /// Request target.
    pub target: String,
    /// The authority the request was addressed to.
    pub authority: String,
    /// Declared payload size.
    pub len: Option<u64>,
    /// Whether the payload uses chunked framing.
    pub chunked: bool,
    /// Whether the request negotiates `100 Continue`.
    pub expect: bool,
}

impl ServerConn {
    /// The address the client dialed.
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Read one newline-terminated line, without the newline. `None` on
    /// end of stream.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches('\n').to_owned()),
        }
    }

    /// Read the next request head; `None` on end of stream.
    pub async fn read_request(&mut self) -> Option<MockRequest> {
        let line = self.read_line().await?;
        let mut parts = line.split(' ');
        assert_eq!(parts.next(), Some("REQ"), "unexpected line: {line}");
        let method = parts.next().expect("method").to_owned();
        let target = parts.next().expect("target").to_owned();
        let authority = parts.next().expect("authority").to_owned();
        let len_token = parts
            .next()
            .and_then(|t| t.strip_prefix("len="))
            .expect("len field");
        let (len, chunked) = if len_token == "chunked" {
            (None, true)
        } else {
            (Some(len_token.parse().expect("len value")), false)
        };
        let expect = parts
            .next()
            .and_then(|t| t.strip_prefix("expect="))
            .map(|t| t == "1")
            .unwrap_or(false);
        Some(MockRequest {
            method,
            target,
            authority,
            len,
            chunked,
            expect,
        })
    }

    /// Read `DATA` blocks until `DONE`, returning the collected payload.
    pub async fn read_payload(&mut self) -> Option<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "DONE" {
                return Some(payload);
            }
            let n: usize = line
                .strip_prefix("DATA ")
                .unwrap_or_else(|| panic!("unexpected line: {line}"))
                .parse()
                .expect("chunk length");
            let mut chunk = vec![0u8; n + 1];
            self.reader.read_exact(&mut chunk).await.ok()?;
            chunk.pop(); // trailing newline
            payload.extend_from_slice(&chunk);
        }
    }

    /// Send an interim `100 Continue`.
    pub async fn send_continue(&mut self) {
        self.send_raw("100\n").await;
    }

    /// Send a response head.
    pub async fn send_head(&mut self, status: u16, close: bool, extra: &[(&str, &str)]) {
        let mut line = format!("HEAD {status} {}", if close { "close" } else { "keep" });
        for (name, value) in extra {
            line.push_str(&format!(" {name}={value}"));
        }
        line.push('\n');
        self.send_raw(&line).await;
    }

    /// Send one payload chunk.
    pub async fn send_body(&mut self, text: &str) {
        self.send_raw(&format!("BODY {text}\n")).await;
    }

    /// End the response payload.
    pub async fn send_end(&mut self) {
        self.send_raw("END\n").await;
    }

    /// Send a complete keep-alive response.
    pub async fn respond(&mut self, status: u16, body: &str) {
        self.send_head(status, false, &[]).await;
        if !body.is_empty() {
            self.send_body(body).await;
        }
        self.send_end().await;
    }

    /// Write raw bytes to the stream.
    pub async fn send_raw(&mut self, data: &str) {
        self.writer
            .write_all(data.as_bytes())
            .await
            .expect("mock peer write");
        self.writer.flush().await.expect("mock peer flush");
    }

    /// Shut down the server end of the stream.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl std::fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConn")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// The line-oriented codec.
#[derive(Debug, Default)]
pub struct MockCodec {
    _priv: (),
}

/// Produces [`MockCodec`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockCodecFactory;

impl CodecFactory for MockCodecFactory {
    fn codec(&self) -> Box<dyn HttpCodec> {
        Box::new(MockCodec::default())
    }
}

impl HttpCodec for MockCodec {
    fn encode_head(&mut self, head: &RequestHead, dst: &mut BytesMut) {
        let len = match head.payload_len {
            Some(len) => len.to_string(),
            None => "chunked".to_owned(),
        };
        let expect = if head.expect_continue { 1 } else { 0 };
        dst.extend_from_slice(
            format!(
                "REQ {} {} {} len={} expect={}\n",
                head.method, head.target, head.authority, len, expect
            )
            .as_bytes(),
        );
    }

    fn encode_body_chunk(&mut self, chunk: &[u8], _chunked: bool, dst: &mut BytesMut) {
        dst.extend_from_slice(format!("DATA {}\n", chunk.len()).as_bytes());
        dst.extend_from_slice(chunk);
        dst.extend_from_slice(b"\n");
    }

    fn encode_body_end(&mut self, _chunked: bool, dst: &mut BytesMut) {
        dst.extend_from_slice(b"DONE\n");
    }

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DecodeEvent>, CodecError> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(pos + 1);
        let line = std::str::from_utf8(&line[..line.len() - 1])
            .map_err(|_| CodecError::new("response line is not utf-8"))?;

        if line == "100" {
            return Ok(Some(DecodeEvent::Continue));
        }
        if line == "END" {
            return Ok(Some(DecodeEvent::End));
        }
        if let Some(text) = line.strip_prefix("BODY ") {
            return Ok(Some(DecodeEvent::Body(Bytes::copy_from_slice(
                text.as_bytes(),
            ))));
        }
        if let Some(rest) = line.strip_prefix("HEAD ") {
            let mut parts = rest.split(' ');
            let status: StatusCode = parts
                .next()
                .and_then(|t| t.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| CodecError::new("bad status"))?;
            let close = match parts.next() {
                Some("close") => true,
                Some("keep") => false,
                other => return Err(CodecError::new(format!("bad close token: {other:?}"))),
            };
            let mut headers = HeaderMap::new();
            for pair in parts {
                let (name, value) = pair
                    .split_once('=')
                    .ok_or_else(|| CodecError::new(format!("bad header pair: {pair}")))?;
                let name: http::header::HeaderName = name
                    .parse()
                    .map_err(|_| CodecError::new("bad header name"))?;
                let value = value
                    .parse()
                    .map_err(|_| CodecError::new("bad header value"))?;
                headers.append(name, value);
            }
            return Ok(Some(DecodeEvent::Head(ResponseHead {
                status,
                version: Version::HTTP_11,
                headers,
                close,
            })));
        }

        Err(CodecError::new(format!("unrecognized line: {line}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_full_lines() {
        let mut codec = MockCodec::default();
        let mut buf = BytesMut::from(&b"HEAD 200 ke"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ep\nBODY hi\nEND\n");
        let head = codec.decode(&mut buf).unwrap().unwrap();
        match head {
            DecodeEvent::Head(head) => {
                assert_eq!(head.status, StatusCode::OK);
                assert!(!head.close);
            }
            other => panic!("expected head, got {other:?}"),
        }
        match codec.decode(&mut buf).unwrap().unwrap() {
            DecodeEvent::Body(body) => assert_eq!(&body[..], b"hi"),
            other => panic!("expected body, got {other:?}"),
        }
        assert!(matches!(
            codec.decode(&mut buf).unwrap().unwrap(),
            DecodeEvent::End
        ));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_headers_and_close() {
        let mut codec = MockCodec::default();
        let mut buf = BytesMut::from(&b"HEAD 302 close location=/next retry-after=3\n"[..]);
        match codec.decode(&mut buf).unwrap().unwrap() {
            DecodeEvent::Head(head) => {
                assert_eq!(head.status, StatusCode::FOUND);
                assert!(head.close);
                assert_eq!(head.location(), Some("/next"));
                assert_eq!(head.retry_after(), Some(Duration::from_secs(3)));
            }
            other => panic!("expected head, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_junk() {
        let mut codec = MockCodec::default();
        let mut buf = BytesMut::from(&b"WHAT\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_request_head() {
        let mut codec = MockCodec::default();
        let mut dst = BytesMut::new();
        codec.encode_head(
            &RequestHead {
                method: http::Method::POST,
                target: "/submit".to_owned(),
                authority: "example.com".to_owned(),
                headers: HeaderMap::new(),
                payload_len: Some(5),
                chunked: false,
                expect_continue: true,
            },
            &mut dst,
        );
        assert_eq!(&dst[..], b"REQ POST /submit example.com len=5 expect=1\n");
    }

    #[tokio::test]
    async fn refused_connects_fail() {
        let (transport, _listener) = MockTransport::new();
        let ip = IpAddr::from([10, 0, 0, 9]);
        transport.script(ip, Script::Refuse);
        let err = match transport.connect(SocketAddr::new(ip, 80)).await {
            Ok(_) => panic!("refused dial produced a stream"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(transport.dials(ip), 1);
    }

    #[tokio::test]
    async fn accepted_connects_reach_the_listener() {
        let (transport, mut listener) = MockTransport::new();
        let addr = SocketAddr::new(IpAddr::from([10, 0, 0, 1]), 80);
        let io = transport.connect(addr).await.unwrap();
        let server = listener.accept().await;
        assert_eq!(server.peer_addr(), addr);
        drop(io);
    }
}
