//! Typed delivery events and their scheduling order.

use std::cmp::Ordering;
use std::net::SocketAddr;
use std::time::Instant;

use crate::network::Packet;
use crate::socket::SocketId;

/// Unique id of a scheduled event, assigned in posting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

/// Work the network delivers to a socket on the scheduler's turn.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// A datagram or stream segment reached its recipient
    PacketArrived(Packet),
    /// A peer at `from` asks to open a stream connection
    ConnectRequest {
        /// Address the requesting socket reports as its own
        from: SocketAddr,
    },
    /// The peer went away, or nobody accepted the connection
    Disconnect,
    /// The socket's bind completed and its address may be inspected
    AddressBound,
    /// In-flight capacity freed up; resume draining the send buffer
    DrainSendBuffer,
}

impl NetworkEvent {
    /// Returns string representation of event type for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkEvent::PacketArrived(_) => "PacketArrived",
            NetworkEvent::ConnectRequest { .. } => "ConnectRequest",
            NetworkEvent::Disconnect => "Disconnect",
            NetworkEvent::AddressBound => "AddressBound",
            NetworkEvent::DrainSendBuffer => "DrainSendBuffer",
        }
    }
}

/// Event waiting in the scheduler queue.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    /// Unique event ID for deterministic ordering
    pub id: EventId,
    /// Scheduled execution time
    pub timestamp: Instant,
    /// Socket the event is delivered to
    pub target: SocketId,
    /// What is delivered
    pub event: NetworkEvent,
}

impl Eq for ScheduledEvent {}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier timestamp first, then posting order; reversed for min-heap
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
            .reverse()
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;
    use std::time::Duration;

    use super::*;

    fn event(id: u64, timestamp: Instant) -> ScheduledEvent {
        ScheduledEvent {
            id: EventId(id),
            timestamp,
            target: SocketId(1),
            event: NetworkEvent::Disconnect,
        }
    }

    #[test]
    fn test_event_timestamp_ordering() {
        let now = Instant::now();
        let early = event(2, now);
        let late = event(1, now + Duration::from_millis(1));

        // Ord is reversed for min-heap behavior, so early > late
        assert!(early > late);
    }

    #[test]
    fn test_same_timestamp_keeps_posting_order() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(event(3, now));
        heap.push(event(1, now));
        heap.push(event(2, now));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.id.0)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_event_type_string_conversion() {
        let event = NetworkEvent::ConnectRequest {
            from: "127.0.0.1:1".parse().unwrap(),
        };
        assert_eq!(event.as_str(), "ConnectRequest");
        assert_eq!(NetworkEvent::DrainSendBuffer.as_str(), "DrainSendBuffer");
    }
}
