//! Requests, their handles, and the in-flight task representation.
//!
//! A caller builds a [`Request`], submits it, and holds a
//! [`RequestHandle`]: a future resolving to exactly one [`Outcome`],
//! either a [`Response`] or a [`Tunnel`] for CONNECT, or to a terminal
//! [`Error`]. Dropping the handle withdraws the request.
//!
//! Internally a request travels as a [`Task`]: the serializable head, the
//! body, the attempt and redirect counters, and the one-shot completion
//! sender whose ownership is what makes delivery exactly-once no matter
//! how many internal retries the request survives.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::sync::oneshot;

use crate::address::{AddrKind, AddrTemplate};
use crate::body::{Body, ResponseBody};
use crate::codec::{RequestHead, ResponseHead};
use crate::error::Error;
use crate::transport::BoxIo;

/// An outgoing HTTP request.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
    urgent: bool,
    connect_tunnel: bool,
    connect_direct: bool,
    ssl_tunnel: bool,
    /// The authority string that failed to parse as a URI, kept so the
    /// eventual error names what the caller actually passed.
    invalid_target: Option<Arc<str>>,
}

impl Request {
    /// A request with the given method and target URI.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Body::Empty,
            urgent: false,
            connect_tunnel: false,
            connect_direct: false,
            ssl_tunnel: false,
            invalid_target: None,
        }
    }

    /// A GET request.
    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    /// A POST request with a body.
    pub fn post(uri: Uri, body: impl Into<Body>) -> Self {
        Self::new(Method::POST, uri).with_body(body)
    }

    /// A CONNECT request establishing a tunnel to `host:port`. On success
    /// the outcome is a [`Tunnel`] carrying the raw stream.
    pub fn connect(host: &str, port: u16) -> Self {
        let authority = format!("{host}:{port}");
        let mut request = match Uri::try_from(format!("http://{authority}/")) {
            Ok(uri) => Self::new(Method::CONNECT, uri),
            Err(_) => {
                let mut request = Self::new(Method::CONNECT, Uri::default());
                request.invalid_target = Some(authority.into());
                request
            }
        };
        request.connect_tunnel = true;
        request
    }

    /// A CONNECT request whose tunnel will carry TLS once established.
    /// The tunnel peer is pooled separately from plain tunnels to the same
    /// place; the stream handed back is the raw tunnel, before any TLS.
    pub fn connect_secure(host: &str, port: u16) -> Self {
        let mut request = Self::connect(host, port);
        request.ssl_tunnel = true;
        request
    }

    /// A CONNECT request straight to an IP, bypassing DNS.
    pub fn connect_ip(ip: IpAddr, port: u16) -> Self {
        let host = match ip {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };
        let mut request = Self::connect(&host, port);
        request.connect_direct = true;
        request
    }

    /// Add a header.
    pub fn with_header(
        mut self,
        name: http::header::HeaderName,
        value: http::header::HeaderValue,
    ) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the request body.
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Mark the request urgent: it is claimed ahead of every non-urgent
    /// request queued for the same destination.
    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }
}

/// Successful terminal outcome of a request.
#[derive(Debug)]
pub enum Outcome {
    /// A response arrived.
    Response(Response),
    /// A CONNECT succeeded and the connection became a tunnel.
    Tunnel(Tunnel),
}

impl Outcome {
    /// The response, if this outcome is one.
    pub fn response(self) -> Option<Response> {
        match self {
            Outcome::Response(response) => Some(response),
            Outcome::Tunnel(_) => None,
        }
    }

    /// The tunnel, if this outcome is one.
    pub fn tunnel(self) -> Option<Tunnel> {
        match self {
            Outcome::Tunnel(tunnel) => Some(tunnel),
            Outcome::Response(_) => None,
        }
    }
}

/// A received response: the parsed head plus the payload as it streams in.
#[derive(Debug)]
pub struct Response {
    head: ResponseHead,
    body: ResponseBody,
}

impl Response {
    pub(crate) fn new(head: ResponseHead, body: ResponseBody) -> Self {
        Self { head, body }
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// The parsed head.
    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Mutable access to the payload stream.
    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Consume the response, keeping only the payload stream.
    pub fn into_body(self) -> ResponseBody {
        self.body
    }
}

/// A connection repurposed as an opaque byte stream via CONNECT.
pub struct Tunnel {
    io: BoxIo,
}

impl Tunnel {
    pub(crate) fn new(io: BoxIo) -> Self {
        Self { io }
    }

    /// Take the raw stream.
    pub fn into_io(self) -> BoxIo {
        self.io
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel").finish_non_exhaustive()
    }
}

/// The caller's side of a submitted request.
///
/// Resolves once, to the request's outcome. Dropping the handle withdraws
/// the request: a queued request is silently discarded, and a response
/// already on the wire is read out and thrown away so the connection's
/// response order stays intact.
#[derive(Debug)]
pub struct RequestHandle {
    rx: oneshot::Receiver<Result<Outcome, Error>>,
}

impl RequestHandle {
    /// Withdraw the request.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Future for RequestHandle {
    type Output = Result<Outcome, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Aborted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) fn completion() -> (oneshot::Sender<Result<Outcome, Error>>, RequestHandle) {
    let (tx, rx) = oneshot::channel();
    (tx, RequestHandle { rx })
}

/// Decrements the client's pending-request gauge when the task finishes.
pub(crate) struct PendingGuard(pub(crate) Arc<AtomicUsize>);

impl PendingGuard {
    pub(crate) fn new(gauge: Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for PendingGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingGuard")
    }
}

/// The parsed destination of a request URI.
#[derive(Debug, Clone)]
pub(crate) struct Destination {
    pub(crate) host: Arc<str>,
    pub(crate) port: u16,
    pub(crate) secure: bool,
    pub(crate) target: String,
    pub(crate) authority: String,
}

pub(crate) fn parse_destination(uri: &Uri) -> Result<Destination, Error> {
    let invalid = || Error::InvalidUri(uri.to_string().into());

    let secure = match uri.scheme_str() {
        Some("http") | None => false,
        Some("https") => true,
        Some(_) => return Err(invalid()),
    };
    let host = uri.host().ok_or_else(invalid)?;
    let host: Arc<str> = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
        .into();
    let default_port = if secure { 443 } else { 80 };
    let port = uri.port_u16().unwrap_or(default_port);

    let target = uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .filter(|pq| !pq.is_empty())
        .unwrap_or_else(|| "/".to_owned());

    let authority = if port == default_port {
        host.to_string()
    } else if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    Ok(Destination {
        host,
        port,
        secure,
        target,
        authority,
    })
}

/// A request in flight through the host/queue/peer/connection chain.
pub(crate) struct Task {
    pub(crate) id: u64,
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) authority: String,
    pub(crate) host: Arc<str>,
    pub(crate) port: u16,
    pub(crate) secure: bool,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) urgent: bool,
    /// Deprioritized behind fresh submissions (set when the request was
    /// parked after a transient failure).
    pub(crate) delayed: bool,
    pub(crate) connect_tunnel: bool,
    pub(crate) connect_direct: bool,
    pub(crate) ssl_tunnel: bool,
    /// Bytes of the body were already handed to a connection; the body can
    /// no longer be replayed.
    pub(crate) body_started: bool,
    pub(crate) attempts: u32,
    pub(crate) redirects: u32,
    tx: Option<oneshot::Sender<Result<Outcome, Error>>>,
    _pending: Option<PendingGuard>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("authority", &self.authority)
            .field("target", &self.target)
            .field("attempts", &self.attempts)
            .field("redirects", &self.redirects)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(crate) fn new(
        mut request: Request,
        id: u64,
        tx: oneshot::Sender<Result<Outcome, Error>>,
        pending: PendingGuard,
    ) -> Result<Self, (oneshot::Sender<Result<Outcome, Error>>, Error)> {
        if let Some(authority) = request.invalid_target.take() {
            return Err((tx, Error::InvalidUri(authority)));
        }
        let destination = match parse_destination(&request.uri) {
            Ok(destination) => destination,
            Err(error) => return Err((tx, error)),
        };

        let target = if request.connect_tunnel {
            // CONNECT uses the authority form, IPv6 bracketed.
            destination.authority.clone()
        } else {
            destination.target
        };

        Ok(Self {
            id,
            method: request.method,
            target,
            authority: destination.authority,
            host: destination.host,
            port: destination.port,
            secure: destination.secure,
            headers: request.headers,
            body: request.body,
            urgent: request.urgent,
            delayed: false,
            connect_tunnel: request.connect_tunnel,
            connect_direct: request.connect_direct,
            ssl_tunnel: request.ssl_tunnel,
            body_started: false,
            attempts: 0,
            redirects: 0,
            tx: Some(tx),
            _pending: Some(pending),
        })
    }

    /// The destination template this task routes through, following the
    /// scheme-variant mapping: direct connects are raw streams, secure
    /// targets carry the SNI name, tunnel bootstraps use the tunnel
    /// variant.
    pub(crate) fn peer_template(&self) -> AddrTemplate {
        if self.connect_direct {
            AddrTemplate {
                kind: AddrKind::Raw,
                tls_name: None,
                port: self.port,
            }
        } else if self.ssl_tunnel {
            AddrTemplate {
                kind: AddrKind::HttpsTunnel,
                tls_name: Some(self.host.clone()),
                port: self.port,
            }
        } else if self.secure {
            AddrTemplate {
                kind: AddrKind::Https,
                tls_name: Some(self.host.clone()),
                port: self.port,
            }
        } else {
            AddrTemplate {
                kind: AddrKind::Http,
                tls_name: None,
                port: self.port,
            }
        }
    }

    /// Whether the caller has withdrawn the request.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Deliver the terminal outcome. A second call is a no-op; the sender
    /// is consumed by the first.
    pub(crate) fn complete(&mut self, outcome: Result<Outcome, Error>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
        self._pending = None;
    }

    /// Shorthand for failing the task.
    pub(crate) fn fail(&mut self, error: Error) {
        self.complete(Err(error));
    }

    /// Build the head the codec will serialize, inserting `Host` when the
    /// caller did not provide one.
    pub(crate) fn request_head(&self, expect_continue: bool) -> RequestHead {
        let mut headers = self.headers.clone();
        if !headers.contains_key(http::header::HOST) {
            if let Ok(value) = self.authority.parse() {
                headers.insert(http::header::HOST, value);
            }
        }

        RequestHead {
            method: self.method.clone(),
            target: self.target.clone(),
            authority: self.authority.clone(),
            headers,
            payload_len: self.body.len(),
            chunked: self.body.is_chunked(),
            expect_continue,
        }
    }

    /// Whether the body can be sent (again) on a fresh connection.
    pub(crate) fn can_replay_body(&self) -> bool {
        match self.body {
            Body::Empty | Body::Full(_) => true,
            Body::Streaming { .. } => !self.body_started,
        }
    }

    /// Rewrite the task to follow a redirect. 301/302/303 rewrite non-HEAD
    /// methods to GET and drop the body; 307/308 preserve both.
    pub(crate) fn apply_redirect(
        &mut self,
        status: StatusCode,
        location: &str,
        limit: u32,
    ) -> Result<(), Error> {
        if self.redirects >= limit {
            return Err(Error::TooManyRedirects(limit));
        }

        let uri: Uri = if location.starts_with('/') {
            let scheme = if self.secure { "https" } else { "http" };
            format!("{scheme}://{}{location}", self.authority)
                .parse()
                .map_err(|_| Error::InvalidUri(location.into()))?
        } else {
            location
                .parse()
                .map_err(|_| Error::InvalidUri(location.into()))?
        };

        let destination = parse_destination(&uri)?;

        let preserve_method = self.method == Method::HEAD
            || status == StatusCode::TEMPORARY_REDIRECT
            || status == StatusCode::PERMANENT_REDIRECT;
        if preserve_method {
            if !self.can_replay_body() {
                return Err(Error::Payload(
                    "cannot replay a streaming body across a redirect".into(),
                ));
            }
        } else {
            self.method = Method::GET;
            self.body = Body::Empty;
            self.body_started = false;
        }

        self.target = destination.target;
        self.authority = destination.authority;
        self.host = destination.host;
        self.port = destination.port;
        self.secure = destination.secure;
        self.redirects += 1;
        // A fresh destination gets a fresh attempt budget.
        self.attempts = 0;
        Ok(())
    }
}
