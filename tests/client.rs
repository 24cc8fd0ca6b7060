//! End-to-end request flows against the in-memory transport.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use wirepool::dns::StaticResolver;
use wirepool::mock::{MockCodecFactory, MockListener, MockTransport, Script};
use wirepool::{Client, Config, Error, Outcome, Request};

const ORIGIN: &str = "origin.test";

fn ip(last: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, last])
}

fn setup(ips: &[IpAddr], config: Config) -> (Client, MockTransport, MockListener) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (transport, listener) = MockTransport::new();
    let resolver = StaticResolver::new().entry(ORIGIN, ips.iter().copied());
    let client = Client::builder(MockCodecFactory)
        .config(config)
        .resolver(resolver)
        .transport(transport.clone())
        .build();
    (client, transport, listener)
}

fn get(path: &str) -> Request {
    Request::get(format!("http://{ORIGIN}{path}").parse().unwrap())
}

fn post(path: &str, body: &'static str) -> Request {
    Request::post(format!("http://{ORIGIN}{path}").parse().unwrap(), body)
}

#[tokio::test]
async fn get_roundtrip() {
    let (client, _transport, mut listener) = setup(&[ip(1)], Config::default());

    let handle = client.submit(get("/"));
    let mut server = listener.accept().await;

    let request = server.read_request().await.unwrap();
    assert_eq!(request.method, "GET");
    assert_eq!(request.target, "/");
    assert_eq!(request.authority, ORIGIN);
    assert_eq!(request.len, Some(0));
    assert!(!request.expect);

    server.send_head(200, false, &[]).await;
    server.send_body("he").await;
    server.send_body("llo").await;
    server.send_end().await;

    let response = handle.await.unwrap().response().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.into_body().bytes().await.unwrap()[..], b"hello");
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn sequential_requests_reuse_the_connection() {
    let (client, transport, mut listener) = setup(&[ip(1)], Config::default());

    let first = client.submit(get("/one"));
    let mut server = listener.accept().await;
    assert_eq!(server.read_request().await.unwrap().target, "/one");
    server.respond(200, "1").await;
    first.await.unwrap();

    let second = client.submit(get("/two"));
    assert_eq!(server.read_request().await.unwrap().target, "/two");
    server.respond(200, "2").await;
    second.await.unwrap();

    assert_eq!(transport.dials(ip(1)), 1);
}

#[tokio::test]
async fn urgent_requests_are_claimed_first() {
    let (client, transport, mut listener) = setup(&[ip(1)], Config::default());
    transport.script(ip(1), Script::AcceptAfter(Duration::from_millis(50)));

    // Both wait in the queue until the connection is up.
    let normal = client.submit(get("/normal"));
    let urgent = client.submit(get("/urgent").urgent());

    let mut server = listener.accept().await;
    assert_eq!(server.read_request().await.unwrap().target, "/urgent");
    server.respond(200, "").await;
    assert_eq!(server.read_request().await.unwrap().target, "/normal");
    server.respond(200, "").await;

    urgent.await.unwrap();
    normal.await.unwrap();
}

#[tokio::test]
async fn expect_continue_sends_payload_after_interim() {
    let config = Config {
        continue_payload_threshold: 1,
        ..Config::default()
    };
    let (client, _transport, mut listener) = setup(&[ip(1)], config);

    let handle = client.submit(post("/submit", "hello"));
    let mut server = listener.accept().await;

    let request = server.read_request().await.unwrap();
    assert!(request.expect);
    assert_eq!(request.len, Some(5));

    server.send_continue().await;
    assert_eq!(server.read_payload().await.unwrap(), b"hello");
    server.respond(200, "ok").await;

    let response = handle.await.unwrap().response().unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn continue_timeout_sends_payload_and_disables_negotiation() {
    let config = Config {
        continue_payload_threshold: 1,
        continue_timeout: Duration::from_millis(50),
        ..Config::default()
    };
    let (client, _transport, mut listener) = setup(&[ip(1)], config);

    let first = client.submit(post("/a", "hello"));
    let mut server = listener.accept().await;
    assert!(server.read_request().await.unwrap().expect);
    // No interim; the payload arrives anyway once the wait expires.
    assert_eq!(server.read_payload().await.unwrap(), b"hello");
    server.respond(200, "").await;
    first.await.unwrap();

    // The peer has learned: no more negotiation.
    let second = client.submit(post("/b", "world"));
    assert!(!server.read_request().await.unwrap().expect);
    assert_eq!(server.read_payload().await.unwrap(), b"world");
    server.respond(200, "").await;
    second.await.unwrap();
}

#[tokio::test]
async fn redirect_is_followed() {
    let (client, transport, mut listener) = setup(&[ip(1)], Config::default());

    let handle = client.submit(get("/old"));
    let mut server = listener.accept().await;

    assert_eq!(server.read_request().await.unwrap().target, "/old");
    server.send_head(302, false, &[("location", "/new")]).await;
    server.send_end().await;

    assert_eq!(server.read_request().await.unwrap().target, "/new");
    server.respond(200, "moved").await;

    let response = handle.await.unwrap().response().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.into_body().bytes().await.unwrap()[..], b"moved");
    assert_eq!(transport.dials(ip(1)), 1);
}

#[tokio::test]
async fn redirect_budget_is_enforced() {
    let config = Config {
        max_redirects: 1,
        ..Config::default()
    };
    let (client, _transport, mut listener) = setup(&[ip(1)], config);

    let handle = client.submit(get("/a"));
    let mut server = listener.accept().await;

    server.read_request().await.unwrap();
    server.send_head(302, false, &[("location", "/b")]).await;
    server.send_end().await;

    server.read_request().await.unwrap();
    server.send_head(302, false, &[("location", "/c")]).await;
    server.send_end().await;

    assert!(matches!(handle.await, Err(Error::TooManyRedirects(1))));
}

#[tokio::test]
async fn connect_turns_the_stream_into_a_tunnel() {
    let (client, _transport, mut listener) = setup(&[], Config::default());

    let handle = client.submit(Request::connect_ip(ip(7), 9000));
    let mut server = listener.accept().await;

    let request = server.read_request().await.unwrap();
    assert_eq!(request.method, "CONNECT");
    assert_eq!(request.target, "10.0.0.7:9000");

    server.send_head(200, false, &[]).await;

    let tunnel = match handle.await.unwrap() {
        Outcome::Tunnel(tunnel) => tunnel,
        other => panic!("expected tunnel, got {other:?}"),
    };
    let mut io = tunnel.into_io();

    // The server end sees raw bytes, and raw bytes flow back.
    io.write_all(b"ping\n").await.unwrap();
    io.flush().await.unwrap();
    assert_eq!(server.read_line().await.as_deref(), Some("ping"));

    server.send_raw("pong\n").await;
    let mut buf = [0u8; 5];
    io.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong\n");
}

#[tokio::test]
async fn overlong_streaming_payload_fails_the_request() {
    let (client, _transport, mut listener) = setup(&[ip(1)], Config::default());

    // Declares two bytes, produces five.
    let body = wirepool::Body::streaming(
        Some(2),
        futures_util::stream::iter([Ok(bytes::Bytes::from_static(b"hello"))]),
    );
    let handle = client.submit(post("/upload", "").with_body(body));

    let mut server = listener.accept().await;
    let request = server.read_request().await.unwrap();
    assert_eq!(request.len, Some(2));

    assert!(matches!(handle.await, Err(Error::Payload(_))));
}

#[tokio::test]
async fn withdrawn_requests_are_never_sent() {
    let config = Config {
        idle_timeout: Duration::from_millis(100),
        ..Config::default()
    };
    let (client, transport, mut listener) = setup(&[ip(1)], config);
    transport.script(ip(1), Script::AcceptAfter(Duration::from_millis(50)));

    let handle = client.submit(get("/"));
    handle.cancel();

    // The connection comes up, finds nothing to send, and idles out.
    let mut server = listener.accept().await;
    assert!(server.read_request().await.is_none());
    assert_eq!(client.pending_requests(), 0);
}
