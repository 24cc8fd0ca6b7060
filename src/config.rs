//! Configuration for a [`Client`][crate::Client].
//!
//! Every timeout the connection layer arms, and every ceiling the queue
//! respects, is an explicit field here rather than a constant buried in the
//! state machine. Defaults are conservative and match long-standing
//! production values for this kind of client (30 second connects, a
//! 2 second `100 Continue` wait, a 5 minute overall request deadline).

use std::time::Duration;

/// Configuration for a client and everything it manages.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on one DNS lookup.
    pub dns_lookup_timeout: Duration,

    /// Upper bound on one transport connect (including the TLS handshake).
    pub connect_timeout: Duration,

    /// When set, the delay after which a queue starts a parallel connection
    /// attempt against the next resolved address without cancelling the
    /// first. `None` disables the fan-out and attempts addresses strictly
    /// one at a time.
    pub soft_connect_timeout: Option<Duration>,

    /// Upper bound between a request being fully sent and its response
    /// arriving on the connection.
    pub request_timeout: Duration,

    /// How long a connection waits for `100 Continue` before sending the
    /// payload anyway.
    pub continue_timeout: Duration,

    /// How long a connection with no outstanding requests stays open.
    pub idle_timeout: Duration,

    /// Ceiling on simultaneous connections (live plus connecting) per
    /// destination address template.
    pub max_parallel_connections: usize,

    /// Ceiling on requests in flight on one connection. Values above 1
    /// permit pipelining once the peer has proven it tolerates it.
    pub max_pipelined_requests: usize,

    /// How many connections a single request may be handed before its
    /// failure is surfaced to the caller.
    pub max_attempts: u32,

    /// How many redirect responses a single request may follow.
    pub max_redirects: u32,

    /// Payloads at or above this declared size (or of unknown size)
    /// negotiate `Expect: 100-continue` unless the peer has already shown
    /// it does not honor it.
    pub continue_payload_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns_lookup_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            soft_connect_timeout: None,
            request_timeout: Duration::from_secs(60 * 5),
            continue_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
            max_parallel_connections: 1,
            max_pipelined_requests: 1,
            max_attempts: 3,
            max_redirects: 5,
            continue_payload_threshold: 1024,
        }
    }
}

impl Config {
    pub(crate) fn pipelining_configured(&self) -> bool {
        self.max_pipelined_requests > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensible_defaults() {
        let config = Config::default();
        assert!(config.connect_timeout > Duration::from_secs(1));
        assert!(config.continue_timeout < config.request_timeout);
        assert!(config.soft_connect_timeout.is_none());
        assert_eq!(config.max_parallel_connections, 1);
        assert!(!config.pipelining_configured());
        assert!(config.max_attempts >= 1);
    }
}
