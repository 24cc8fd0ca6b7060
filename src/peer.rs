//! One peer per concrete resolved address.
//!
//! The peer owns the connections: it spawns attempts up to the parallel
//! ceiling, holds a handle per live connection, and runs the dispatch loop
//! that claims waiting tasks round-robin from every queue linked to it.
//! Dispatch triggers are coalesced; everything that frees capacity or adds
//! work schedules one deferred pass rather than dispatching inline.
//!
//! The peer is also where per-destination behavior is learned: whether the
//! server honors `Expect: 100-continue`, and whether it has proven it
//! tolerates pipelined requests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::address::PeerAddr;
use crate::client::Shared;
use crate::config::Config;
use crate::error::{Error, Phase};
use crate::queue::Queue;
use crate::request::Task;
use crate::transport::BoxIo;
use crate::weakopt::WeakOpt;

/// What a queue learns when it asks a peer for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnRequest {
    /// A live connection has capacity; a dispatch pass will claim tasks.
    Claimable,
    /// An attempt is in flight (possibly just started). The queue may arm
    /// its soft fan-out timer.
    Connecting,
    /// The parallel-connection ceiling is reached and every connection is
    /// saturated; capacity will free up on its own.
    AtLimit,
}

pub(crate) struct Peer {
    pub(crate) addr: PeerAddr,
    shared: WeakOpt<Shared>,
    state: Mutex<PeerState>,
    rr: AtomicUsize,
}

struct PeerState {
    queues: Vec<Weak<Queue>>,
    conns: Vec<ConnHandle>,
    connecting: usize,
    allows_pipelining: bool,
    seen_continue: bool,
    no_payload_sync: bool,
    dispatch_scheduled: bool,
    dispatching: bool,
    /// A trigger arrived while a pass was running; run another pass before
    /// releasing `dispatching`.
    dispatch_again: bool,
}

/// The peer's handle on one live connection: the task channel plus the
/// counters the dispatch loop admits against.
#[derive(Clone)]
pub(crate) struct ConnHandle {
    pub(crate) id: u64,
    pub(crate) tx: mpsc::UnboundedSender<Task>,
    pub(crate) stats: Arc<ConnStats>,
}

/// Shared between a connection driver and its peer.
#[derive(Debug, Default)]
pub(crate) struct ConnStats {
    pending: AtomicUsize,
    closing: AtomicBool,
}

impl ConnStats {
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn incr_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decr_pending(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }
}

impl Peer {
    pub(crate) fn new(addr: PeerAddr, shared: WeakOpt<Shared>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            shared,
            state: Mutex::new(PeerState {
                queues: Vec::new(),
                conns: Vec::new(),
                connecting: 0,
                allows_pipelining: false,
                seen_continue: false,
                no_payload_sync: false,
                dispatch_scheduled: false,
                dispatching: false,
                dispatch_again: false,
            }),
            rr: AtomicUsize::new(0),
        })
    }

    /// Link a queue so dispatch claims from it. Idempotent.
    pub(crate) fn link_queue(&self, queue: &Arc<Queue>) {
        let mut state = self.state.lock();
        let present = state
            .queues
            .iter()
            .any(|weak| weak.as_ptr() == Arc::as_ptr(queue));
        if !present {
            state.queues.push(Arc::downgrade(queue));
        }
    }

    /// A queue has work for this peer. Start a connection attempt when
    /// none could serve it, otherwise report what is already underway.
    pub(crate) fn request_connection(self: &Arc<Self>) -> ConnRequest {
        let Some(shared) = self.shared.upgrade() else {
            return ConnRequest::AtLimit;
        };
        let config = &shared.config;

        enum Action {
            Claimable,
            Start,
            Connecting,
            AtLimit,
        }

        let action = {
            let mut state = self.state.lock();
            let allowed = Self::allowed(&state, config);
            let claimable = state
                .conns
                .iter()
                .any(|conn| !conn.stats.closing() && conn.stats.pending() < allowed);
            if claimable {
                Action::Claimable
            } else if state.conns.len() + state.connecting < config.max_parallel_connections {
                state.connecting += 1;
                Action::Start
            } else if state.connecting > 0 {
                Action::Connecting
            } else {
                Action::AtLimit
            }
        };

        match action {
            Action::Claimable => {
                self.schedule_dispatch();
                ConnRequest::Claimable
            }
            Action::Start => {
                self.spawn_attempt(shared);
                ConnRequest::Connecting
            }
            Action::Connecting => ConnRequest::Connecting,
            Action::AtLimit => ConnRequest::AtLimit,
        }
    }

    fn allowed(state: &PeerState, config: &Config) -> usize {
        if state.allows_pipelining && config.pipelining_configured() {
            config.max_pipelined_requests
        } else {
            1
        }
    }

    fn spawn_attempt(self: &Arc<Self>, shared: Arc<Shared>) {
        let peer = self.clone();
        tokio::spawn(async move {
            debug!(peer.addr = %peer.addr, "connection attempt starting");
            let result = tokio::time::timeout(
                shared.config.connect_timeout,
                establish(&shared, &peer.addr),
            )
            .await
            .unwrap_or(Err(Error::Timeout(Phase::Connect)));

            match result {
                Ok(io) => peer.attempt_succeeded(&shared, io),
                Err(error) => peer.attempt_failed(error),
            }
        });
    }

    fn attempt_succeeded(self: &Arc<Self>, shared: &Arc<Shared>, io: BoxIo) {
        let id = shared.next_id();
        let codec = shared.codecs.codec();
        let handle = crate::conn::spawn(id, self.clone(), shared.config.clone(), io, codec);
        debug!(peer.addr = %self.addr, conn.id = id, "connection established");

        let queues = {
            let mut state = self.state.lock();
            state.connecting -= 1;
            state.conns.push(handle);
            snapshot_queues(&mut state)
        };
        for queue in queues {
            queue.connection_made(&self.addr);
        }
        self.dispatch();
    }

    fn attempt_failed(self: &Arc<Self>, error: Error) {
        debug!(peer.addr = %self.addr, %error, "connection attempt failed");
        let queues = {
            let mut state = self.state.lock();
            state.connecting -= 1;
            snapshot_queues(&mut state)
        };
        for queue in queues {
            queue.connection_failed(&self.addr, &error);
        }
        self.maybe_prune();
    }

    /// Schedule one deferred dispatch pass, coalescing bursts of triggers.
    pub(crate) fn schedule_dispatch(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.dispatch_scheduled {
                return;
            }
            state.dispatch_scheduled = true;
        }
        let peer = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            peer.state.lock().dispatch_scheduled = false;
            peer.dispatch();
        });
    }

    /// Claim tasks from linked queues round-robin and hand them to
    /// connections with capacity, until either runs out.
    fn dispatch(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.dispatching {
                // The running pass may already be past its last claim;
                // leave it a marker instead of dropping the trigger.
                state.dispatch_again = true;
                return;
            }
            state.dispatching = true;
        }
        let Some(shared) = self.shared.upgrade() else {
            let mut state = self.state.lock();
            state.dispatching = false;
            state.dispatch_again = false;
            return;
        };

        loop {
            self.dispatch_pass(&shared);
            let mut state = self.state.lock();
            if state.dispatch_again {
                state.dispatch_again = false;
            } else {
                state.dispatching = false;
                return;
            }
        }
    }

    fn dispatch_pass(self: &Arc<Self>, shared: &Arc<Shared>) {
        loop {
            let (handle, queues) = {
                let mut state = self.state.lock();
                let allowed = Self::allowed(&state, &shared.config);
                let handle = state
                    .conns
                    .iter()
                    .find(|conn| !conn.stats.closing() && conn.stats.pending() < allowed)
                    .cloned();
                (handle, snapshot_queues(&mut state))
            };

            let Some(handle) = handle else { break };
            if queues.is_empty() {
                break;
            }

            let start = self.rr.fetch_add(1, Ordering::Relaxed);
            let mut claimed = None;
            for offset in 0..queues.len() {
                if let Some(task) = queues[(start + offset) % queues.len()].claim_task() {
                    claimed = Some(task);
                    break;
                }
            }
            let Some(task) = claimed else { break };

            trace!(peer.addr = %self.addr, conn.id = handle.id, request.id = task.id,
                "handing request to connection");
            handle.stats.incr_pending();
            if let Err(send_error) = handle.tx.send(task) {
                // The driver wound down between the snapshot and the send.
                handle.stats.decr_pending();
                self.remove_conn(handle.id);
                shared.submit_task(send_error.0);
            }
        }
    }

    /// Whether a request with this payload should negotiate
    /// `Expect: 100-continue` before sending it.
    pub(crate) fn wants_payload_sync(&self, task: &Task, config: &Config) -> bool {
        if task.connect_tunnel {
            return false;
        }
        let large = match task.body.len() {
            Some(0) => return false,
            Some(len) => len >= config.continue_payload_threshold,
            None => true,
        };
        large && !self.state.lock().no_payload_sync
    }

    /// The server sent a `100 Continue`.
    pub(crate) fn note_seen_continue(&self) {
        self.state.lock().seen_continue = true;
    }

    /// The continue wait timed out; stop negotiating for this peer.
    pub(crate) fn note_continue_timeout(&self) {
        let mut state = self.state.lock();
        if !state.no_payload_sync {
            debug!(peer.addr = %self.addr, "continue wait timed out, disabling payload sync");
            state.no_payload_sync = true;
        }
    }

    /// A connection completed its second keep-alive response; the peer has
    /// proven it handles back-to-back requests, so pipelining may begin.
    pub(crate) fn note_pipelining_ok(&self) {
        let mut state = self.state.lock();
        if !state.allows_pipelining {
            debug!(peer.addr = %self.addr, "peer allows pipelining");
            state.allows_pipelining = true;
        }
    }

    pub(crate) fn allows_pipelining(&self) -> bool {
        self.state.lock().allows_pipelining
    }

    /// A pipelined connection was lost mid-flight, or a response demanded
    /// close; withdraw pipelining until the peer proves itself again.
    pub(crate) fn note_pipelining_broken(&self) {
        let mut state = self.state.lock();
        if state.allows_pipelining {
            debug!(peer.addr = %self.addr, "pipelining withdrawn");
            state.allows_pipelining = false;
        }
    }

    /// A connection driver has wound down; forget its handle and get any
    /// still-queued work moving again.
    pub(crate) fn remove_conn(self: &Arc<Self>, id: u64) {
        let queues = {
            let mut state = self.state.lock();
            state.conns.retain(|conn| conn.id != id);
            snapshot_queues(&mut state)
        };
        for queue in queues {
            if queue.has_tasks() {
                queue.dispatch();
            }
        }
        self.maybe_prune();
    }

    /// Re-enter a task through the client, re-routing by its (possibly
    /// rewritten) destination.
    pub(crate) fn resubmit(&self, task: Task) {
        if let Some(shared) = self.shared.upgrade() {
            shared.submit_task(task);
        }
    }

    fn maybe_prune(self: &Arc<Self>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let idle = {
            let mut state = self.state.lock();
            state.conns.is_empty()
                && state.connecting == 0
                && snapshot_queues(&mut state)
                    .iter()
                    .all(|queue| !queue.has_tasks())
        };
        if idle {
            shared.prune_peer(&self.addr, self);
        }
    }
}

fn snapshot_queues(state: &mut PeerState) -> Vec<Arc<Queue>> {
    state.queues.retain(|weak| weak.strong_count() > 0);
    state.queues.iter().filter_map(Weak::upgrade).collect()
}

async fn establish(shared: &Arc<Shared>, addr: &PeerAddr) -> Result<BoxIo, Error> {
    let io = shared
        .transport
        .connect(addr.socket_addr())
        .await
        .map_err(|error| Error::Connect {
            addr: addr.clone(),
            message: error.to_string().into(),
        })?;

    if addr.kind.is_tls() {
        #[cfg(feature = "tls")]
        {
            let name = addr
                .tls_name
                .as_deref()
                .map(str::to_owned)
                .unwrap_or_else(|| addr.ip.to_string());
            return shared.tls.wrap(io, &name).await;
        }
        #[cfg(not(feature = "tls"))]
        {
            drop(io);
            return Err(Error::TlsUnavailable);
        }
    }

    Ok(io)
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("conns", &state.conns.len())
            .field("connecting", &state.connecting)
            .field("allows_pipelining", &state.allows_pipelining)
            .field("seen_continue", &state.seen_continue)
            .field("no_payload_sync", &state.no_payload_sync)
            .finish()
    }
}
