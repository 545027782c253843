//! Vnet Simulator - Deterministic in-process virtual socket network.

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! This crate lets networking code be tested without touching the host's
//! network stack. Sockets exchange datagrams and byte streams over a
//! simulated link with latency, jitter, bandwidth, loss and flow control.
//!
//! # Features
//!
//! - **Deterministic Execution**: Same seed always produces identical results
//! - **Virtual Time**: Deliveries are events on a virtual-time scheduler
//! - **Datagrams and Streams**: Unordered lossy UDP and ordered flow-controlled TCP
//! - **Dual Stack**: IPv4, IPv6 and IPv4-mapped addressing rules
//! - **Invariant Checking**: Validate table and buffer consistency during execution
//!
//! # Example
//!
//! ```rust,no_run
//! use vnet_core::{IpFamily, NetworkConfig};
//! use vnet_sim::{SocketKind, VirtualNetwork};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let network = VirtualNetwork::new(NetworkConfig::deterministic_testing());
//!
//! let server = network.create_socket(IpFamily::V4, SocketKind::Datagram);
//! server.bind("127.0.0.1:5000".parse()?)?;
//! let client = network.create_socket(IpFamily::V4, SocketKind::Datagram);
//! client.send_to(b"ping", "127.0.0.1:5000".parse()?)?;
//!
//! network.process_messages_until_idle();
//!
//! let mut buf = [0u8; 16];
//! let (read, from) = server.recv_from(&mut buf)?;
//! println!("{read} bytes from {from}");
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Scheduler**: Min-heap of typed events over a virtual clock
//! - **Network**: Socket arena, binding and connection tables, packet injection
//! - **Sockets**: Id handles into the arena with BSD-style operations
//! - **Notifications**: Subscriptions fired outside the network lock

pub mod delay;
pub mod deterministic;
pub mod network;
pub mod notify;
pub mod socket;

pub use delay::DelayModel;
pub use deterministic::{
    ConnectionProvenanceInvariant, ConnectionSymmetryInvariant, DeterministicClock,
    DeterministicRng, DeterministicScheduler, InFlightCapacityInvariant, Invariant,
    InvariantViolation, NetworkEvent, ReceiveWindowInvariant, Scheduler, SchedulerError,
    UniqueBindingInvariant,
};
pub use network::{
    NetworkSnapshot, NetworkStats, ProcessReport, SocketSnapshot, VirtualNetwork,
    VirtualNetworkBuilder,
};
pub use notify::{EventLog, SocketEvent, SocketEventKind, Subscription};
pub use socket::{ConnState, SocketId, SocketKind, SocketOption, VirtualSocket};

use std::sync::Arc;

/// Every built-in invariant, ready to register on a network.
pub fn standard_invariants() -> Vec<Arc<dyn Invariant>> {
    vec![
        Arc::new(InFlightCapacityInvariant),
        Arc::new(ReceiveWindowInvariant),
        Arc::new(UniqueBindingInvariant),
        Arc::new(ConnectionProvenanceInvariant),
        Arc::new(ConnectionSymmetryInvariant),
    ]
}
