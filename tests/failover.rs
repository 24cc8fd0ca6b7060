//! Address failover, soft connect fan-out, and retry behavior.

use std::net::IpAddr;
use std::time::Duration;

use wirepool::dns::StaticResolver;
use wirepool::mock::{MockCodecFactory, MockListener, MockTransport, Script};
use wirepool::{Client, Config, Error, Request};

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

#[tokio::test]
async fn failover_to_the_next_address() {
    let (client, transport, mut listener) = setup(&[ip(1), ip(2)], Config::default());
    transport.script(ip(1), Script::Refuse);

    let handle = client.submit(get("/"));
    let mut server = listener.accept().await;
    assert_eq!(server.peer_addr().ip(), ip(2));

    server.read_request().await.unwrap();
    server.respond(200, "ok").await;
    handle.await.unwrap();

    assert_eq!(transport.dials(ip(1)), 1);
    assert_eq!(transport.dials(ip(2)), 1);
}

#[tokio::test]
async fn next_round_starts_at_the_last_successful_address() {
    let (client, transport, mut listener) = setup(&[ip(1), ip(2)], Config::default());
    transport.script(ip(1), Script::Refuse);

    let first = client.submit(get("/a"));
    let mut server = listener.accept().await;
    server.read_request().await.unwrap();
    // Close after responding so the second request needs a fresh connect.
    server.send_head(200, true, &[]).await;
    server.send_end().await;
    first.await.unwrap();

    let second = client.submit(get("/b"));
    let mut server = listener.accept().await;
    assert_eq!(server.peer_addr().ip(), ip(2));
    server.read_request().await.unwrap();
    server.respond(200, "").await;
    second.await.unwrap();

    // The refused first address is never dialed again.
    assert_eq!(transport.dials(ip(1)), 1);
    assert_eq!(transport.dials(ip(2)), 2);
}

#[tokio::test]
async fn exhausted_round_fails_every_queued_request() {
    let (client, transport, _listener) = setup(&[ip(1), ip(2)], Config::default());
    transport.script(ip(1), Script::Refuse);
    transport.script(ip(2), Script::Refuse);

    let first = client.submit(get("/a"));
    let second = client.submit(get("/b"));

    assert!(matches!(first.await, Err(Error::Connect { .. })));
    assert!(matches!(second.await, Err(Error::Connect { .. })));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn dns_failure_fails_every_queued_request() {
    let (transport, _listener) = MockTransport::new();
    let client = Client::builder(MockCodecFactory)
        .resolver(StaticResolver::new())
        .transport(transport)
        .build();

    let first = client.submit(get("/a"));
    let second = client.submit(get("/b"));

    assert!(matches!(first.await, Err(Error::Resolve { .. })));
    assert!(matches!(second.await, Err(Error::Resolve { .. })));
}

#[tokio::test]
async fn soft_timeout_races_the_next_address() {
    let config = Config {
        soft_connect_timeout: Some(Duration::from_millis(50)),
        ..Config::default()
    };
    let (client, transport, mut listener) = setup(&[ip(1), ip(2)], config);
    transport.script(ip(1), Script::Hang);

    let handle = client.submit(get("/"));
    let mut server = listener.accept().await;
    assert_eq!(server.peer_addr().ip(), ip(2));

    server.read_request().await.unwrap();
    server.respond(200, "ok").await;
    handle.await.unwrap();

    // The slow attempt was started and left running, not cancelled up front.
    assert_eq!(transport.dials(ip(1)), 1);
    assert_eq!(transport.dials(ip(2)), 1);
}

#[tokio::test]
async fn lost_connection_is_retried_transparently() {
    let (client, transport, mut listener) = setup(&[ip(1)], Config::default());

    let handle = client.submit(get("/"));

    let mut first = listener.accept().await;
    first.read_request().await.unwrap();
    // Drop the connection before answering.
    first.close().await;

    let mut second = listener.accept().await;
    second.read_request().await.unwrap();
    second.respond(200, "recovered").await;

    let response = handle.await.unwrap().response().unwrap();
    assert_eq!(&response.into_body().bytes().await.unwrap()[..], b"recovered");
    assert_eq!(transport.dials(ip(1)), 2);
}

#[tokio::test]
async fn retry_budget_is_enforced() {
    let config = Config {
        max_attempts: 2,
        ..Config::default()
    };
    let (client, _transport, mut listener) = setup(&[ip(1)], config);

    let handle = client.submit(get("/"));

    for _ in 0..2 {
        let mut server = listener.accept().await;
        server.read_request().await.unwrap();
        server.close().await;
    }

    assert!(matches!(handle.await, Err(Error::ConnectionLost(_))));
}
