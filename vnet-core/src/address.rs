//! Address helpers shared by the simulator.
//!
//! The simulator keys every table by family-normalized socket addresses:
//! IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) collapse to plain IPv4 so a
//! socket bound through either spelling owns the same table slot.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Address family of a socket or address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpFamily {
    /// Returns the family an IP address belongs to, without normalization.
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Returns the wildcard ("any") IP for this family.
    pub fn any_ip(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Returns the loopback IP for this family.
    pub fn loopback_ip(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    /// Returns the wildcard socket address with port 0 for this family.
    pub fn any_address(self) -> SocketAddr {
        SocketAddr::new(self.any_ip(), 0)
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "ipv4"),
            IpFamily::V6 => write!(f, "ipv6"),
        }
    }
}

/// Normalization and classification helpers for socket addresses.
pub trait AddressExt {
    /// Collapses IPv4-mapped IPv6 forms into canonical IPv4.
    fn normalized(&self) -> Self;

    /// Family of the address as spelled, before normalization.
    fn family(&self) -> IpFamily;

    /// True for `0.0.0.0` and `::`.
    fn is_any_ip(&self) -> bool;
}

impl AddressExt for IpAddr {
    fn normalized(&self) -> Self {
        self.to_canonical()
    }

    fn family(&self) -> IpFamily {
        IpFamily::of(self)
    }

    fn is_any_ip(&self) -> bool {
        self.is_unspecified()
    }
}

impl AddressExt for SocketAddr {
    fn normalized(&self) -> Self {
        SocketAddr::new(self.ip().normalized(), self.port())
    }

    fn family(&self) -> IpFamily {
        IpFamily::of(&self.ip())
    }

    fn is_any_ip(&self) -> bool {
        self.ip().is_unspecified()
    }
}

/// Directed pair of normalized addresses identifying one half of a stream
/// connection.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct SocketPair {
    /// Address the bytes come from
    pub local: SocketAddr,
    /// Address the bytes go to
    pub remote: SocketAddr,
}

impl SocketPair {
    /// Builds a pair, normalizing both ends.
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            local: local.normalized(),
            remote: remote.normalized(),
        }
    }

    /// Returns the opposite direction of this pair.
    pub fn reversed(&self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl fmt::Display for SocketPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_ipv6_normalizes_to_ipv4() {
        let mapped: SocketAddr = "[::ffff:127.0.0.2]:5000".parse().unwrap();
        let normalized = mapped.normalized();

        assert_eq!(normalized, "127.0.0.2:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(mapped.family(), IpFamily::V6);
        assert_eq!(normalized.family(), IpFamily::V4);
    }

    #[test]
    fn test_plain_ipv6_is_not_rewritten() {
        let addr: SocketAddr = "[::2]:80".parse().unwrap();
        assert_eq!(addr.normalized(), addr);
    }

    #[test]
    fn test_any_detection() {
        assert!(IpFamily::V4.any_address().is_any_ip());
        assert!(IpFamily::V6.any_address().is_any_ip());
        assert!(!"127.0.0.1:0".parse::<SocketAddr>().unwrap().is_any_ip());
    }

    #[test]
    fn test_socket_pair_normalizes_and_reverses() {
        let a: SocketAddr = "[::ffff:10.0.0.1]:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:2".parse().unwrap();
        let pair = SocketPair::new(a, b);

        assert_eq!(pair.local, "10.0.0.1:1".parse::<SocketAddr>().unwrap());
        assert_eq!(pair.reversed(), SocketPair::new(b, a));
    }
}
