//! Wirepool
//!
//! The connection-management core of an HTTP/1.1 client: the layered
//! hierarchy of host, queue, peer and connection that turns a stream of
//! outgoing requests into a bounded set of pooled, possibly-pipelined
//! TCP/TLS connections.
//!
//! A [`Client`] is a process-scoped registry: one host per DNS name, one
//! queue per destination template inside it, one peer per resolved address,
//! and one driver task per live connection. Requests are submitted with
//! [`Client::submit`] and complete through a [`request::RequestHandle`]
//! future, exactly once.
//!
//! The pieces this crate deliberately does not contain live behind seams:
//! DNS resolution ([`dns::Resolve`]), the byte transport
//! ([`transport::Transport`]), the TLS wrapper (the `tls` feature), and the
//! HTTP message grammar ([`codec::HttpCodec`]).

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;
use std::future::Future;
use std::pin::Pin;

pub mod address;
pub mod body;
pub mod client;
pub mod codec;
pub mod config;
mod conn;
pub mod dns;
pub mod error;
mod host;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
mod peer;
mod queue;
pub mod request;
#[cfg(feature = "tls")]
pub mod tls;
pub mod transport;
mod weakopt;

pub use body::Body;
pub use client::Client;
pub use config::Config;
pub use error::Error;
pub use request::{Outcome, Request, RequestHandle, Response, Tunnel};

/// A boxed error, used at the seams where collaborator error types are
/// consumed opaquely.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[allow(unused)]
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
