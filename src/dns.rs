//! DNS resolution seam.
//!
//! The core only ever consumes a completed, ordered address list or an
//! error; the mechanics live behind [`Resolve`]. The default
//! [`GaiResolver`] asks the operating system via `getaddrinfo` on a
//! blocking worker thread. [`StaticResolver`] serves fixed entries and is
//! what the tests use to control address ordering.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::BoxFuture;

/// An asynchronous hostname resolver.
///
/// Implementations return the addresses in the order they should be
/// attempted; the queue's failover round walks that order.
pub trait Resolve: Send + Sync + 'static {
    /// Resolve a hostname to an ordered list of IP addresses.
    fn resolve(&self, host: &str) -> BoxFuture<'static, Result<Vec<IpAddr>, io::Error>>;
}

/// GetAddrInfo based resolver.
///
/// This resolver uses the `getaddrinfo` system call to resolve hostnames to
/// IP addresses via the operating system, on a blocking worker thread.
#[derive(Debug, Default, Clone)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, host: &str) -> BoxFuture<'static, Result<Vec<IpAddr>, io::Error>> {
        let span = tracing::Span::current();
        let host: Box<str> = host.into();
        Box::pin(async move {
            let handle = tokio::task::spawn_blocking(move || {
                tracing::trace_span!(parent: &span, "getaddrinfo").in_scope(|| {
                    tracing::trace!("dns resolution starting");
                    // Port 0 here; the queue template carries the real port.
                    (host.as_ref(), 0)
                        .to_socket_addrs()
                        .map(|addrs| addrs.map(|addr| addr.ip()).collect::<Vec<_>>())
                })
            });

            match handle.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_cancelled() => {
                    Err(io::Error::new(io::ErrorKind::Interrupted, join_err))
                }
                Err(join_err) => Err(io::Error::other(join_err)),
            }
        })
    }
}

/// A resolver backed by a fixed table, for tests and static deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<Arc<str>, Vec<IpAddr>>,
    delay: Option<Duration>,
}

impl StaticResolver {
    /// Create an empty static resolver. Unknown hosts resolve to a
    /// not-found error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host entry with an ordered address list.
    pub fn entry(mut self, host: &str, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.entries.insert(host.into(), ips.into_iter().collect());
        self
    }

    /// Delay every lookup, to exercise asynchronous resolution paths.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Resolve for StaticResolver {
    fn resolve(&self, host: &str) -> BoxFuture<'static, Result<Vec<IpAddr>, io::Error>> {
        let result = self.entries.get(host).cloned();
        let delay = self.delay;
        let host = host.to_owned();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match result {
                Some(ips) => Ok(ips),
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses known for {host}"),
                )),
            }
        })
    }
}
