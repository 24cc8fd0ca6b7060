//! Client error type.
//!
//! One variant per failure class: resolution, connect, protocol,
//! application-policy and request-local failures. Lower layers never report
//! to the caller directly; errors travel connection → peer → queue → host
//! and the request layer decides between retry and surfacing, so each
//! caller-visible outcome is produced exactly once.
//!
//! Variants carry owned strings rather than source errors because one
//! failure (a DNS error, an exhausted failover round) fans out to many
//! queued requests and must be cloneable.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::address::PeerAddr;

/// The phase a hard deadline expired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Phase {
    /// Waiting for the DNS lookup to complete.
    Resolve,
    /// Waiting for the transport (and TLS) to connect.
    Connect,
    /// Waiting for the response after the request was sent.
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Resolve => f.write_str("dns lookup"),
            Phase::Connect => f.write_str("connect"),
            Phase::Response => f.write_str("response wait"),
        }
    }
}

/// Terminal outcome of a failed request.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The request URI could not be turned into a destination.
    #[error("invalid uri: {0}")]
    InvalidUri(Arc<str>),

    /// DNS lookup failed; fatal for every request queued under the host at
    /// that moment.
    #[error("lookup of {host} failed: {message}")]
    Resolve {
        /// The host name that failed to resolve.
        host: Arc<str>,
        /// Resolver-provided detail.
        message: Arc<str>,
    },

    /// Connecting to one concrete address failed and the failover round is
    /// exhausted.
    #[error("connect to {addr} failed: {message}")]
    Connect {
        /// The last address attempted.
        addr: PeerAddr,
        /// Transport-provided detail.
        message: Arc<str>,
    },

    /// The TLS layer could not be initialized or the handshake failed.
    #[error("tls: {0}")]
    Tls(Arc<str>),

    /// TLS support is not compiled in but the request requires it.
    #[error("https requested but tls support is not enabled")]
    TlsUnavailable,

    /// The peer violated the protocol: malformed response, a response with
    /// no request at the head of the wait-list, or similar. Fatal for the
    /// connection.
    #[error("protocol error: {0}")]
    Protocol(Arc<str>),

    /// The connection went away while requests were outstanding and the
    /// attempt budget is spent.
    #[error("connection lost: {0}")]
    ConnectionLost(Arc<str>),

    /// A hard per-phase deadline expired.
    #[error("{0} timed out")]
    Timeout(Phase),

    /// Reading the request payload stream failed.
    #[error("payload: {0}")]
    Payload(Arc<str>),

    /// The redirect budget is spent.
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(u32),

    /// The request was withdrawn before a response was received.
    #[error("request aborted")]
    Aborted,
}

impl Error {
    pub(crate) fn protocol(message: impl fmt::Display) -> Self {
        Error::Protocol(message.to_string().into())
    }

    pub(crate) fn lost(message: impl fmt::Display) -> Self {
        Error::ConnectionLost(message.to_string().into())
    }

    /// Whether a request that hit this error on an internal path may be
    /// transparently handed to another connection.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. } | Error::ConnectionLost(_) | Error::Timeout(Phase::Connect)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: std::error::Error, Send, Sync, Clone);

    #[test]
    fn display() {
        let err = Error::Resolve {
            host: "example.com".into(),
            message: "no such host".into(),
        };
        assert_eq!(err.to_string(), "lookup of example.com failed: no such host");

        assert_eq!(
            Error::Timeout(Phase::Connect).to_string(),
            "connect timed out"
        );
        assert_eq!(
            Error::Timeout(Phase::Response).to_string(),
            "response wait timed out"
        );
    }

    #[test]
    fn retryable() {
        assert!(Error::lost("eof").is_retryable());
        assert!(!Error::Aborted.is_retryable());
        assert!(!Error::protocol("junk").is_retryable());
    }
}
