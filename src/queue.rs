//! One queue per destination template under a host.
//!
//! The queue is where waiting requests live and where address failover is
//! decided. It walks the host's resolved address list in order: each round
//! starts at the index the previous successful connection established, a
//! failed attempt advances to the next address, and only when every
//! address of the round has failed do the queued requests fail, each with
//! the last connect error, delivered as one deferred batch.
//!
//! With a soft connect timeout configured, a slow attempt does not block
//! the round: when the timer fires the queue starts a parallel attempt
//! against the next address while the first keeps running, and whichever
//! connection is established first wins.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::address::{AddrTemplate, PeerAddr};
use crate::client::Shared;
use crate::error::Error;
use crate::host::Host;
use crate::peer::ConnRequest;
use crate::request::Task;
use crate::weakopt::WeakOpt;

pub(crate) struct Queue {
    template: AddrTemplate,
    host: WeakOpt<Host>,
    shared: WeakOpt<Shared>,
    state: Mutex<QueueState>,
}

struct QueueState {
    urgent: VecDeque<Task>,
    normal: VecDeque<Task>,
    /// Deprioritized requests, parked earlier after a transient failure.
    delayed: VecDeque<Task>,
    /// Index into the host's address list the current attempt targets.
    connect_idx: usize,
    /// Where the current failover round started; reaching it again means
    /// the round is exhausted.
    connect_start_idx: usize,
    /// Addresses that failed in the current round.
    failed: HashSet<IpAddr>,
    /// How many parallel soft-timeout attempts this round has fanned out.
    fanout: usize,
    /// Invalidates in-flight soft timers when the round ends.
    generation: u64,
    soft_armed: bool,
    last_error: Option<Error>,
}

impl QueueState {
    fn has_tasks(&self) -> bool {
        !self.urgent.is_empty() || !self.normal.is_empty() || !self.delayed.is_empty()
    }

    fn drain(&mut self) -> Vec<Task> {
        self.urgent
            .drain(..)
            .chain(self.normal.drain(..))
            .chain(self.delayed.drain(..))
            .collect()
    }
}

impl Queue {
    pub(crate) fn new(
        template: AddrTemplate,
        host: WeakOpt<Host>,
        shared: WeakOpt<Shared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            template,
            host,
            shared,
            state: Mutex::new(QueueState {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
                delayed: VecDeque::new(),
                connect_idx: 0,
                connect_start_idx: 0,
                failed: HashSet::new(),
                fanout: 0,
                generation: 0,
                soft_armed: false,
                last_error: None,
            }),
        })
    }

    /// Append a task to its lane. Does not dispatch; the host does that
    /// once addresses are known.
    pub(crate) fn push(&self, task: Task) {
        let mut state = self.state.lock();
        if task.urgent {
            state.urgent.push_back(task);
        } else if task.delayed {
            state.delayed.push_back(task);
        } else {
            state.normal.push_back(task);
        }
    }

    /// Whether any requests are waiting to be claimed.
    pub(crate) fn has_tasks(&self) -> bool {
        self.state.lock().has_tasks()
    }

    /// Hand out the next waiting task: urgent lane first, then normal,
    /// then delayed, silently discarding withdrawn requests. Called by the
    /// peer's dispatch loop.
    pub(crate) fn claim_task(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            let task = state
                .urgent
                .pop_front()
                .or_else(|| state.normal.pop_front())
                .or_else(|| state.delayed.pop_front())?;
            if task.is_cancelled() {
                trace!(request.id = task.id, "discarding withdrawn request");
                continue;
            }
            return Some(task);
        }
    }

    /// Make progress: pick the current address, make sure its peer has (or
    /// is getting) a connection for us, and arm the soft fan-out timer
    /// when all we can do is wait for a connect.
    pub(crate) fn dispatch(self: &Arc<Self>) {
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let ips = host.addresses();
        if ips.is_empty() {
            return;
        }

        let (addr, generation) = {
            let mut state = self.state.lock();
            if !state.has_tasks() {
                return;
            }
            // Skip addresses that already failed this round.
            let len = ips.len();
            let mut skipped = 0;
            while skipped < len && state.failed.contains(&ips[state.connect_idx % len]) {
                state.connect_idx += 1;
                skipped += 1;
            }
            if skipped == len {
                return;
            }
            let addr = self.template.with_ip(ips[state.connect_idx % len]);
            (addr, state.generation)
        };

        let peer = shared.peer(&addr);
        peer.link_queue(self);
        match peer.request_connection() {
            ConnRequest::Claimable | ConnRequest::AtLimit => {}
            ConnRequest::Connecting => self.arm_soft_timer(&shared, generation),
        }
    }

    fn arm_soft_timer(self: &Arc<Self>, shared: &Arc<Shared>, generation: u64) {
        let Some(delay) = shared.config.soft_connect_timeout else {
            return;
        };
        {
            let mut state = self.state.lock();
            if state.soft_armed || state.generation != generation {
                return;
            }
            state.soft_armed = true;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.soft_timer_fired(generation);
        });
    }

    fn soft_timer_fired(self: &Arc<Self>, generation: u64) {
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let len = host.addresses().len();
        {
            let mut state = self.state.lock();
            state.soft_armed = false;
            if state.generation != generation || !state.has_tasks() {
                return;
            }
            // Fan out to the next address; stop once the round is covered.
            if state.fanout + 1 >= len {
                return;
            }
            state.fanout += 1;
            state.connect_idx += 1;
            trace!(template = %self.template, "soft connect timeout, trying next address");
        }
        self.dispatch();
    }

    /// A connection to `addr` was established. The round ends here: the
    /// next one starts from this address.
    pub(crate) fn connection_made(self: &Arc<Self>, addr: &PeerAddr) {
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let ips = host.addresses();
        let mut state = self.state.lock();
        state.failed.clear();
        state.fanout = 0;
        state.generation += 1;
        state.last_error = None;
        if let Some(pos) = ips.iter().position(|ip| *ip == addr.ip) {
            state.connect_idx = pos;
            state.connect_start_idx = pos;
        }
    }

    /// A connection attempt to `addr` failed: advance the failover round,
    /// or end it when every address has now failed.
    pub(crate) fn connection_failed(self: &Arc<Self>, addr: &PeerAddr, error: &Error) {
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let ips = host.addresses();

        enum After {
            Exhausted(Vec<Task>, Error),
            Retry,
            Nothing,
        }

        let after = {
            let mut state = self.state.lock();
            state.failed.insert(addr.ip);
            state.last_error = Some(error.clone());
            if !state.has_tasks() {
                After::Nothing
            } else if !ips.is_empty() && ips.iter().all(|ip| state.failed.contains(ip)) {
                let tasks = state.drain();
                let error = state.last_error.take().unwrap_or_else(|| error.clone());
                state.failed.clear();
                state.fanout = 0;
                state.generation += 1;
                state.connect_idx = state.connect_start_idx;
                After::Exhausted(tasks, error)
            } else {
                After::Retry
            }
        };

        match after {
            After::Exhausted(tasks, error) => {
                debug!(template = %self.template, requests = tasks.len(), %error,
                    "all addresses failed, failing queued requests");
                Shared::fail_batch(tasks, error);
            }
            After::Retry => self.dispatch(),
            After::Nothing => {}
        }
    }

    /// Fail every queued task with `error`, as one deferred batch.
    pub(crate) fn fail_all(self: &Arc<Self>, error: Error) {
        let tasks = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.failed.clear();
            state.fanout = 0;
            state.drain()
        };
        Shared::fail_batch(tasks, error);
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Queue")
            .field("template", &self.template)
            .field("urgent", &state.urgent.len())
            .field("normal", &state.normal.len())
            .field("delayed", &state.delayed.len())
            .field("connect_idx", &state.connect_idx)
            .finish()
    }
}
