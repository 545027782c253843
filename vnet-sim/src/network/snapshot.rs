//! Read-only views of network state for invariant checks and reporting.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use vnet_core::{IpFamily, SocketPair};

use crate::socket::{ConnState, SocketId, SocketKind};

/// State of one socket at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSnapshot {
    /// Arena id
    pub id: SocketId,
    /// Transport
    pub kind: SocketKind,
    /// Creation family
    pub family: IpFamily,
    /// Connection state
    pub state: ConnState,
    /// True while listening
    pub listening: bool,
    /// Normalized local address
    pub local: Option<SocketAddr>,
    /// Connected peer
    pub remote: Option<SocketAddr>,
    /// Bytes this socket has on the wire
    pub in_flight_bytes: usize,
    /// Bytes queued or in flight toward this socket
    pub recv_window: usize,
    /// Bytes waiting in the send buffer
    pub send_buffered: usize,
    /// Packets waiting to be read
    pub queued_packets: usize,
}

/// State of the whole network at one instant of virtual time.
#[derive(Debug, Clone)]
pub struct NetworkSnapshot {
    /// Virtual time since the network was created
    pub elapsed: Duration,
    /// Per-socket in-flight budget
    pub network_capacity: usize,
    /// Stream send buffer size
    pub send_buffer_capacity: usize,
    /// Stream receive window size
    pub recv_buffer_capacity: usize,
    /// Live sockets ordered by id
    pub sockets: Vec<SocketSnapshot>,
    /// Binding table entries
    pub bindings: Vec<(SocketAddr, SocketId)>,
    /// Connection table entries
    pub connections: Vec<(SocketPair, SocketId)>,
    /// Every address that was ever bound
    pub ever_bound: HashSet<SocketAddr>,
}

impl NetworkSnapshot {
    /// Looks up a socket by id.
    pub fn socket(&self, id: SocketId) -> Option<&SocketSnapshot> {
        self.sockets
            .binary_search_by_key(&id, |socket| socket.id)
            .ok()
            .map(|index| &self.sockets[index])
    }

    /// Number of sockets in `state`.
    pub fn count_in_state(&self, state: ConnState) -> usize {
        self.sockets
            .iter()
            .filter(|socket| socket.state == state)
            .count()
    }

    /// Total bytes on the wire across all sockets.
    pub fn total_in_flight(&self) -> usize {
        self.sockets.iter().map(|socket| socket.in_flight_bytes).sum()
    }
}
