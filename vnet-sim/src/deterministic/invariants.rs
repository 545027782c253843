//! Invariant checking framework for network validation.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::network::NetworkSnapshot;

/// Violation of a network invariant.
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: String,
    /// Detailed description of the violation
    pub description: String,
    /// Virtual time at which the violation was observed
    pub elapsed: Duration,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invariant '{}' violated at {:?}: {}",
            self.invariant, self.elapsed, self.description
        )
    }
}

/// Trait for checking network invariants.
pub trait Invariant: Send + Sync {
    /// Checks if invariant holds for current state.
    ///
    /// # Errors
    ///
    /// - `InvariantViolation` - The invariant condition is not met
    fn check(&self, snapshot: &NetworkSnapshot) -> Result<(), InvariantViolation>;

    /// Returns name of this invariant.
    fn name(&self) -> &str;

    /// True for invariants that only hold once no event is pending.
    fn requires_quiescence(&self) -> bool {
        false
    }
}

fn violation(
    invariant: &dyn Invariant,
    snapshot: &NetworkSnapshot,
    description: String,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.name().to_string(),
        description,
        elapsed: snapshot.elapsed,
    }
}

/// Ensures no socket has more bytes on the wire than the network capacity.
pub struct InFlightCapacityInvariant;

impl Invariant for InFlightCapacityInvariant {
    fn check(&self, snapshot: &NetworkSnapshot) -> Result<(), InvariantViolation> {
        for socket in &snapshot.sockets {
            if socket.in_flight_bytes > snapshot.network_capacity {
                return Err(violation(
                    self,
                    snapshot,
                    format!(
                        "Socket {} has {} bytes in flight, capacity is {}",
                        socket.id, socket.in_flight_bytes, snapshot.network_capacity
                    ),
                ));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "InFlightCapacity"
    }
}

/// Ensures no stream receiver is owed more bytes than its window allows.
pub struct ReceiveWindowInvariant;

impl Invariant for ReceiveWindowInvariant {
    fn check(&self, snapshot: &NetworkSnapshot) -> Result<(), InvariantViolation> {
        for socket in &snapshot.sockets {
            if socket.recv_window > snapshot.recv_buffer_capacity {
                return Err(violation(
                    self,
                    snapshot,
                    format!(
                        "Socket {} receive window holds {} bytes, capacity is {}",
                        socket.id, socket.recv_window, snapshot.recv_buffer_capacity
                    ),
                ));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "ReceiveWindow"
    }
}

/// Ensures every binding belongs to a live socket that reports that
/// address, and that no socket owns two bindings.
pub struct UniqueBindingInvariant;

impl Invariant for UniqueBindingInvariant {
    fn check(&self, snapshot: &NetworkSnapshot) -> Result<(), InvariantViolation> {
        let mut owners = HashSet::new();
        for (addr, id) in &snapshot.bindings {
            if !owners.insert(*id) {
                return Err(violation(
                    self,
                    snapshot,
                    format!("Socket {id} owns more than one binding"),
                ));
            }
            match snapshot.socket(*id) {
                Some(socket) if socket.local == Some(*addr) => {}
                Some(socket) => {
                    return Err(violation(
                        self,
                        snapshot,
                        format!(
                            "Binding {addr} points at socket {id} whose local address is {:?}",
                            socket.local
                        ),
                    ));
                }
                None => {
                    return Err(violation(
                        self,
                        snapshot,
                        format!("Binding {addr} points at destroyed socket {id}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "UniqueBinding"
    }
}

/// Ensures every connection endpoint was bound at some point.
pub struct ConnectionProvenanceInvariant;

impl Invariant for ConnectionProvenanceInvariant {
    fn check(&self, snapshot: &NetworkSnapshot) -> Result<(), InvariantViolation> {
        for (pair, _) in &snapshot.connections {
            for addr in [pair.local, pair.remote] {
                if !snapshot.ever_bound.contains(&addr) {
                    return Err(violation(
                        self,
                        snapshot,
                        format!("Connection {pair} uses {addr}, which was never bound"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "ConnectionProvenance"
    }
}

/// Ensures every stream connection has both directed entries.
///
/// A connect in flight legitimately has only one entry, so this is only
/// checked once the network is idle.
pub struct ConnectionSymmetryInvariant;

impl Invariant for ConnectionSymmetryInvariant {
    fn check(&self, snapshot: &NetworkSnapshot) -> Result<(), InvariantViolation> {
        let pairs: HashSet<_> = snapshot.connections.iter().map(|(pair, _)| *pair).collect();
        for pair in &pairs {
            if !pairs.contains(&pair.reversed()) {
                return Err(violation(
                    self,
                    snapshot,
                    format!("Connection {pair} has no reverse entry"),
                ));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "ConnectionSymmetry"
    }

    fn requires_quiescence(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use vnet_core::{IpFamily, SocketPair};

    use super::*;
    use crate::network::SocketSnapshot;
    use crate::socket::{ConnState, SocketId, SocketKind};

    fn snapshot() -> NetworkSnapshot {
        NetworkSnapshot {
            elapsed: Duration::from_millis(5),
            network_capacity: 1000,
            send_buffer_capacity: 500,
            recv_buffer_capacity: 500,
            sockets: Vec::new(),
            bindings: Vec::new(),
            connections: Vec::new(),
            ever_bound: HashSet::new(),
        }
    }

    fn socket(id: u64, local: Option<SocketAddr>) -> SocketSnapshot {
        SocketSnapshot {
            id: SocketId(id),
            kind: SocketKind::Stream,
            family: IpFamily::V4,
            state: ConnState::Closed,
            listening: false,
            local,
            remote: None,
            in_flight_bytes: 0,
            recv_window: 0,
            send_buffered: 0,
            queued_packets: 0,
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_in_flight_capacity_invariant() {
        let mut state = snapshot();
        state.sockets.push(socket(1, None));
        assert!(InFlightCapacityInvariant.check(&state).is_ok());

        state.sockets[0].in_flight_bytes = 1001;
        let violation = InFlightCapacityInvariant.check(&state).unwrap_err();
        assert_eq!(violation.invariant, "InFlightCapacity");
        assert_eq!(violation.elapsed, Duration::from_millis(5));
    }

    #[test]
    fn test_receive_window_invariant() {
        let mut state = snapshot();
        state.sockets.push(socket(1, None));
        state.sockets[0].recv_window = 500;
        assert!(ReceiveWindowInvariant.check(&state).is_ok());

        state.sockets[0].recv_window = 501;
        assert!(ReceiveWindowInvariant.check(&state).is_err());
    }

    #[test]
    fn test_unique_binding_invariant() {
        let a = addr("1.0.0.1:1000");
        let mut state = snapshot();
        state.sockets.push(socket(1, Some(a)));
        state.bindings.push((a, SocketId(1)));
        assert!(UniqueBindingInvariant.check(&state).is_ok());

        state.bindings.push((addr("1.0.0.1:1001"), SocketId(1)));
        assert!(UniqueBindingInvariant.check(&state).is_err());

        state.bindings = vec![(a, SocketId(2))];
        let violation = UniqueBindingInvariant.check(&state).unwrap_err();
        assert!(violation.description.contains("destroyed"));
    }

    #[test]
    fn test_connection_provenance_invariant() {
        let a = addr("1.0.0.1:1000");
        let b = addr("1.0.0.2:2000");
        let mut state = snapshot();
        state.connections.push((SocketPair::new(a, b), SocketId(1)));
        state.ever_bound.insert(a);
        assert!(ConnectionProvenanceInvariant.check(&state).is_err());

        state.ever_bound.insert(b);
        assert!(ConnectionProvenanceInvariant.check(&state).is_ok());
    }

    #[test]
    fn test_connection_symmetry_invariant() {
        let a = addr("1.0.0.1:1000");
        let b = addr("1.0.0.2:2000");
        let mut state = snapshot();
        state.connections.push((SocketPair::new(a, b), SocketId(1)));
        assert!(ConnectionSymmetryInvariant.requires_quiescence());
        assert!(ConnectionSymmetryInvariant.check(&state).is_err());

        state.connections.push((SocketPair::new(b, a), SocketId(2)));
        assert!(ConnectionSymmetryInvariant.check(&state).is_ok());
    }
}
