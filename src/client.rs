//! The client: a process-scoped registry of hosts, peers and the seams
//! they operate through.
//!
//! A [`Client`] is cheap to clone and internally shared. Submitting a
//! request routes it to the host named in its URI; the host's queues and
//! peers take it from there. Hosts persist for the life of the client
//! (their resolved address lists are the cache); peers are pruned once
//! they have no connections and no queued work.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::address::PeerAddr;
use crate::codec::CodecFactory;
use crate::config::Config;
use crate::dns::{GaiResolver, Resolve};
use crate::error::Error;
use crate::host::Host;
use crate::peer::Peer;
use crate::request::{completion, PendingGuard, Request, RequestHandle, Task};
use crate::transport::{TcpTransport, Transport};
use crate::weakopt::WeakOpt;

/// An HTTP client: connection management for a set of destinations.
///
/// Clones share one registry. Dropping the last clone releases the hosts
/// and peers; connection tasks wind down as their channels close.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Start building a client around the given message codec.
    pub fn builder(codecs: impl CodecFactory) -> Builder {
        Builder {
            config: Config::default(),
            resolver: Box::new(GaiResolver::new()),
            transport: Box::new(TcpTransport::new()),
            codecs: Box::new(codecs),
            #[cfg(feature = "tls")]
            tls_config: None,
        }
    }

    /// Submit a request. The returned handle resolves to the request's
    /// outcome exactly once; dropping it withdraws the request.
    pub fn submit(&self, request: Request) -> RequestHandle {
        let id = self.shared.next_id();
        let (tx, handle) = completion();
        let guard = PendingGuard::new(self.shared.pending.clone());

        match Task::new(request, id, tx, guard) {
            Ok(task) => {
                debug!(request.id = id, authority = %task.authority, method = %task.method, "request submitted");
                self.shared.submit_task(task);
            }
            Err((tx, error)) => {
                let _ = tx.send(Err(error));
            }
        }

        handle
    }

    /// Number of requests submitted but not yet completed.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.load(Ordering::Relaxed)
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

/// Configures and constructs a [`Client`].
pub struct Builder {
    config: Config,
    resolver: Box<dyn Resolve>,
    transport: Box<dyn Transport>,
    codecs: Box<dyn CodecFactory>,
    #[cfg(feature = "tls")]
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl Builder {
    /// Replace the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replace the DNS resolver.
    pub fn resolver(mut self, resolver: impl Resolve) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Replace the byte-stream transport.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Box::new(transport);
        self
    }

    /// Use a specific TLS client configuration instead of the platform
    /// certificate store.
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Build the client.
    pub fn build(self) -> Client {
        Client {
            shared: Arc::new(Shared {
                config: self.config,
                resolver: self.resolver,
                transport: self.transport,
                codecs: self.codecs,
                #[cfg(feature = "tls")]
                tls: crate::tls::TlsContext::new(self.tls_config),
                hosts: Mutex::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                pending: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The registry behind a client, shared by every layer below it.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) resolver: Box<dyn Resolve>,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) codecs: Box<dyn CodecFactory>,
    #[cfg(feature = "tls")]
    pub(crate) tls: crate::tls::TlsContext,
    hosts: Mutex<HashMap<Arc<str>, Arc<Host>>>,
    peers: Mutex<HashMap<PeerAddr, Arc<Peer>>>,
    next_id: AtomicU64,
    pub(crate) pending: Arc<AtomicUsize>,
}

impl Shared {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Route a task to its host, creating the host on first use. Also the
    /// re-entry point for internal resubmission (retries, redirects),
    /// which is why it re-reads the destination from the task.
    pub(crate) fn submit_task(self: &Arc<Self>, task: Task) {
        if task.is_cancelled() {
            return;
        }
        let host = {
            let mut hosts = self.hosts.lock();
            hosts
                .entry(task.host.clone())
                .or_insert_with(|| Host::new(task.host.clone(), WeakOpt::downgrade(self)))
                .clone()
        };
        host.submit(task);
    }

    /// The peer for a concrete address, created on first use.
    pub(crate) fn peer(self: &Arc<Self>, addr: &PeerAddr) -> Arc<Peer> {
        let mut peers = self.peers.lock();
        peers
            .entry(addr.clone())
            .or_insert_with(|| Peer::new(addr.clone(), WeakOpt::downgrade(self)))
            .clone()
    }

    /// Remove a peer from the registry if `peer` is still the registered
    /// instance. Called by the peer itself once it is fully idle.
    pub(crate) fn prune_peer(&self, addr: &PeerAddr, peer: &Arc<Peer>) {
        let mut peers = self.peers.lock();
        if let Some(existing) = peers.get(addr) {
            if Arc::ptr_eq(existing, peer) {
                peers.remove(addr);
                debug!(peer.addr = %addr, "peer pruned");
            }
        }
    }

    /// Errors travel back to the caller from a deferred context, so the
    /// code path that detected the failure has fully unwound first and a
    /// whole batch (a DNS failure, an exhausted failover round) surfaces
    /// together.
    pub(crate) fn fail_batch(tasks: Vec<Task>, error: Error) {
        if tasks.is_empty() {
            return;
        }
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            for mut task in tasks {
                task.fail(error.clone());
            }
        });
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("hosts", &self.hosts.lock().len())
            .field("peers", &self.peers.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCodecFactory;
    use http::Uri;

    #[tokio::test]
    async fn invalid_uri_fails_the_handle() {
        let client = Client::builder(MockCodecFactory).build();
        let handle = client.submit(Request::get(Uri::from_static("ftp://example.com/")));
        assert!(matches!(handle.await, Err(Error::InvalidUri(_))));
        assert_eq!(client.pending_requests(), 0);
    }

    #[test]
    fn clones_share_state() {
        let client = Client::builder(MockCodecFactory).build();
        let other = client.clone();
        assert!(Arc::ptr_eq(&client.shared, &other.shared));
    }
}
