//! One host per DNS name.
//!
//! The host owns the resolved address list and the queues keyed by
//! destination template (scheme variant, TLS name, port). All queues under
//! one host share its addresses; the host guarantees at most one
//! outstanding lookup, and requests submitted while a lookup is in flight
//! simply queue up behind it.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::address::AddrTemplate;
use crate::client::Shared;
use crate::error::{Error, Phase};
use crate::queue::Queue;
use crate::request::Task;
use crate::weakopt::WeakOpt;

pub(crate) struct Host {
    name: Arc<str>,
    shared: WeakOpt<Shared>,
    state: Mutex<HostState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    /// No addresses and no lookup in flight.
    Idle,
    /// A lookup is in flight; its completion dispatches every queue.
    Pending,
    /// Addresses are known.
    Done,
}

struct HostState {
    ips: Vec<IpAddr>,
    lookup: Lookup,
    queues: HashMap<AddrTemplate, Arc<Queue>>,
}

impl Host {
    pub(crate) fn new(name: Arc<str>, shared: WeakOpt<Shared>) -> Arc<Self> {
        Arc::new(Self {
            name,
            shared,
            state: Mutex::new(HostState {
                ips: Vec::new(),
                lookup: Lookup::Idle,
                queues: HashMap::new(),
            }),
        })
    }

    /// The resolved addresses, in attempt order. Empty while unresolved.
    pub(crate) fn addresses(&self) -> Vec<IpAddr> {
        self.state.lock().ips.clone()
    }

    /// Enqueue a task under the matching destination template, then make
    /// sure addresses are available (or being looked up).
    pub(crate) fn submit(self: &Arc<Self>, task: Task) {
        let template = task.peer_template();
        let queue = {
            let mut state = self.state.lock();
            state
                .queues
                .entry(template.clone())
                .or_insert_with(|| {
                    Queue::new(template, WeakOpt::downgrade(self), self.shared.clone())
                })
                .clone()
        };
        queue.push(task);
        self.ensure_addresses();
    }

    fn ensure_addresses(self: &Arc<Self>) {
        enum Action {
            Dispatch(Vec<Arc<Queue>>),
            Lookup,
            Wait,
        }

        let action = {
            let mut state = self.state.lock();
            match state.lookup {
                Lookup::Done => Action::Dispatch(state.queues.values().cloned().collect()),
                Lookup::Pending => Action::Wait,
                Lookup::Idle => {
                    // An IP literal is its own address list.
                    if let Ok(ip) = self.name.parse::<IpAddr>() {
                        state.ips = vec![ip];
                        state.lookup = Lookup::Done;
                        Action::Dispatch(state.queues.values().cloned().collect())
                    } else {
                        state.lookup = Lookup::Pending;
                        Action::Lookup
                    }
                }
            }
        };

        match action {
            Action::Dispatch(queues) => {
                for queue in queues {
                    queue.dispatch();
                }
            }
            Action::Lookup => self.spawn_lookup(),
            Action::Wait => {}
        }
    }

    fn spawn_lookup(self: &Arc<Self>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let host = self.clone();
        tokio::spawn(async move {
            trace!(host = %host.name, "dns lookup starting");
            let result = tokio::time::timeout(
                shared.config.dns_lookup_timeout,
                shared.resolver.resolve(&host.name),
            )
            .await;

            let outcome = match result {
                Ok(Ok(ips)) if !ips.is_empty() => Ok(ips),
                Ok(Ok(_)) => Err(Error::Resolve {
                    host: host.name.clone(),
                    message: "no addresses returned".into(),
                }),
                Ok(Err(error)) => Err(Error::Resolve {
                    host: host.name.clone(),
                    message: error.to_string().into(),
                }),
                Err(_) => Err(Error::Timeout(Phase::Resolve)),
            };
            host.lookup_finished(outcome);
        });
    }

    fn lookup_finished(self: &Arc<Self>, outcome: Result<Vec<IpAddr>, Error>) {
        match outcome {
            Ok(ips) => {
                debug!(host = %self.name, addresses = ips.len(), "dns lookup complete");
                let queues = {
                    let mut state = self.state.lock();
                    state.ips = ips;
                    state.lookup = Lookup::Done;
                    state.queues.values().cloned().collect::<Vec<_>>()
                };
                for queue in queues {
                    queue.dispatch();
                }
            }
            Err(error) => {
                debug!(host = %self.name, %error, "dns lookup failed");
                // Everything queued at this moment fails; the next
                // submission starts a fresh lookup.
                let queues = {
                    let mut state = self.state.lock();
                    state.lookup = Lookup::Idle;
                    state.queues.values().cloned().collect::<Vec<_>>()
                };
                for queue in queues {
                    queue.fail_all(error.clone());
                }
            }
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("ips", &state.ips)
            .field("lookup", &state.lookup)
            .field("queues", &state.queues.len())
            .finish()
    }
}
