//! Packets in flight and per-socket in-flight accounting.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, Bytes};

/// Bytes delivered to a socket, tagged with the sender's address.
///
/// Partial reads consume from the front; the remainder stays queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
    from: SocketAddr,
}

impl Packet {
    /// Wraps `data` sent from `from`.
    pub fn new(data: Bytes, from: SocketAddr) -> Self {
        Self { data, from }
    }

    /// Unread bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True once every byte has been read.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address the recipient observes as the sender.
    pub fn from(&self) -> SocketAddr {
        self.from
    }

    /// Drops the first `count` unread bytes.
    pub fn consume(&mut self, count: usize) {
        self.data.advance(count.min(self.data.len()));
    }
}

/// Bytes a socket injected that still occupy the wire until `done_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkEntry {
    /// Payload plus protocol header
    pub size: usize,
    /// When serialization onto the link completes
    pub done_time: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_consume_keeps_remainder() {
        let from: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let mut packet = Packet::new(Bytes::from_static(b"bizbaz"), from);

        packet.consume(3);
        assert_eq!(packet.data(), b"baz");
        assert_eq!(packet.len(), 3);
        assert_eq!(packet.from(), from);

        packet.consume(10);
        assert!(packet.is_empty());
    }
}
