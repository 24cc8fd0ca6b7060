//! Pipelining, response-order enforcement, and retry-after parking.

use std::net::IpAddr;

use wirepool::dns::StaticResolver;
use wirepool::mock::{MockCodecFactory, MockListener, MockTransport};
use wirepool::{Client, Config, Request};

const ORIGIN: &str = "origin.test";

fn ip(last: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, last])
}

fn setup(config: Config) -> (Client, MockTransport, MockListener) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (transport, listener) = MockTransport::new();
    let resolver = StaticResolver::new().entry(ORIGIN, [ip(1)]);
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

#[tokio::test]
async fn pipelining_begins_once_the_peer_has_proven_itself() {
    let config = Config {
        max_pipelined_requests: 3,
        ..Config::default()
    };
    let (client, _transport, mut listener) = setup(config);

    // Two sequential keep-alive responses teach the peer's tolerance.
    let mut server = {
        let warmup = client.submit(get("/warmup1"));
        let mut server = listener.accept().await;
        server.read_request().await.unwrap();
        server.respond(200, "").await;
        warmup.await.unwrap();

        let warmup = client.submit(get("/warmup2"));
        server.read_request().await.unwrap();
        server.respond(200, "").await;
        warmup.await.unwrap();
        server
    };

    // Now three requests ride the connection back to back: all three
    // heads arrive before any response is written.
    let first = client.submit(get("/1"));
    let second = client.submit(get("/2"));
    let third = client.submit(get("/3"));

    let mut targets = Vec::new();
    for _ in 0..3 {
        targets.push(server.read_request().await.unwrap().target);
    }
    assert_eq!(targets, ["/1", "/2", "/3"]);

    server.respond(200, "one").await;
    server.respond(200, "two").await;
    server.respond(200, "three").await;

    for (handle, body) in [(first, "one"), (second, "two"), (third, "three")] {
        let response = handle.await.unwrap().response().unwrap();
        assert_eq!(
            response.into_body().bytes().await.unwrap(),
            body.as_bytes()
        );
    }
}

#[tokio::test]
async fn unsolicited_response_kills_the_connection() {
    let (client, transport, mut listener) = setup(Config::default());

    let first = client.submit(get("/"));
    let mut server = listener.accept().await;
    server.read_request().await.unwrap();
    server.respond(200, "ok").await;
    first.await.unwrap();

    // A response nobody asked for is a protocol violation; the driver
    // drops the connection.
    server.send_head(200, false, &[]).await;
    server.send_end().await;

    // The next request needs a fresh connection.
    let second = client.submit(get("/again"));
    let mut replacement = listener.accept().await;
    replacement.read_request().await.unwrap();
    replacement.respond(200, "fresh").await;
    second.await.unwrap();

    assert_eq!(transport.dials(ip(1)), 2);
}

#[tokio::test]
async fn retry_after_parks_and_resubmits() {
    let (client, transport, mut listener) = setup(Config::default());

    let handle = client.submit(get("/busy"));
    let mut server = listener.accept().await;

    server.read_request().await.unwrap();
    server.send_head(503, false, &[("retry-after", "0")]).await;
    server.send_end().await;

    // The request comes back on the same connection after the hold-off.
    assert_eq!(server.read_request().await.unwrap().target, "/busy");
    server.respond(200, "later").await;

    let response = handle.await.unwrap().response().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.into_body().bytes().await.unwrap()[..], b"later");
    assert_eq!(transport.dials(ip(1)), 1);
}
