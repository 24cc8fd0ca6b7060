//! Peer addresses: the routing key from queue to peer.
//!
//! A [`PeerAddr`] identifies one concrete destination: scheme variant, IP,
//! port, and the TLS server name when the scheme needs one. Two addresses
//! are equal iff all fields match; the client's peer table is keyed on it,
//! which is what prevents two code paths from opening duplicate connections
//! to the same place.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// The scheme variant of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrKind {
    /// Plain-text HTTP.
    Http,
    /// HTTP over TLS.
    Https,
    /// A CONNECT tunnel that will carry TLS once established.
    HttpsTunnel,
    /// A raw byte stream (direct CONNECT target, no HTTP afterwards).
    Raw,
}

impl AddrKind {
    /// Whether connections to this destination wrap the stream in TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self, AddrKind::Https)
    }

    fn is_tunnel(&self) -> bool {
        matches!(self, AddrKind::HttpsTunnel)
    }
}

/// One concrete resolved destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    /// Scheme variant.
    pub kind: AddrKind,
    /// TLS server name (SNI), when the scheme variant uses TLS.
    pub tls_name: Option<Arc<str>>,
    /// Resolved IP address.
    pub ip: IpAddr,
    /// Destination port.
    pub port: u16,
}

impl PeerAddr {
    /// The socket address to hand to the transport.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.is_ipv6() {
            write!(f, "[{}]:{}", self.ip, self.port)?;
        } else {
            write!(f, "{}:{}", self.ip, self.port)?;
        }
        if self.kind.is_tunnel() {
            f.write_str(" (tunnel)")?;
        }
        Ok(())
    }
}

/// A destination template within a host: everything of a [`PeerAddr`]
/// except the IP, which the queue fills in per connection attempt.
///
/// Queues are keyed on this; all queues under one host share the host's
/// resolved IP list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddrTemplate {
    /// Scheme variant.
    pub kind: AddrKind,
    /// TLS server name (SNI), when the scheme variant uses TLS.
    pub tls_name: Option<Arc<str>>,
    /// Destination port.
    pub port: u16,
}

impl AddrTemplate {
    /// Fill in an IP to produce a concrete peer address.
    pub fn with_ip(&self, ip: IpAddr) -> PeerAddr {
        PeerAddr {
            kind: self.kind,
            tls_name: self.tls_name.clone(),
            ip,
            port: self.port,
        }
    }
}

impl fmt::Display for AddrTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv6Addr;

    fn addr(ip: [u8; 4], port: u16) -> PeerAddr {
        PeerAddr {
            kind: AddrKind::Http,
            tls_name: None,
            ip: IpAddr::from(ip),
            port,
        }
    }

    #[test]
    fn display() {
        assert_eq!(addr([10, 0, 0, 1], 80).to_string(), "10.0.0.1:80");

        let v6 = PeerAddr {
            kind: AddrKind::HttpsTunnel,
            tls_name: Some("example.com".into()),
            ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            port: 443,
        };
        assert_eq!(v6.to_string(), "[::1]:443 (tunnel)");
    }

    #[test]
    fn equality_is_over_all_fields() {
        let a = addr([10, 0, 0, 1], 80);
        let mut b = a.clone();
        assert_eq!(a, b);

        b.port = 81;
        assert_ne!(a, b);

        let mut c = a.clone();
        c.kind = AddrKind::Https;
        assert_ne!(a, c);

        let mut d = a.clone();
        d.tls_name = Some("example.com".into());
        assert_ne!(a, d);
    }

    #[test]
    fn usable_as_table_key() {
        let mut table = HashMap::new();
        table.insert(addr([10, 0, 0, 1], 80), "one");
        assert_eq!(table.get(&addr([10, 0, 0, 1], 80)), Some(&"one"));
        assert_eq!(table.get(&addr([10, 0, 0, 2], 80)), None);
    }

    #[test]
    fn template_fills_ip() {
        let template = AddrTemplate {
            kind: AddrKind::Https,
            tls_name: Some("example.com".into()),
            port: 443,
        };
        let peer = template.with_ip(IpAddr::from([10, 0, 0, 7]));
        assert_eq!(peer.kind, AddrKind::Https);
        assert_eq!(peer.port, 443);
        assert_eq!(peer.socket_addr().to_string(), "10.0.0.7:443");
        assert!(peer.kind.is_tls());
    }
}
