//! Counters describing what the network did with the traffic it carried.

use std::fmt;

/// Cumulative traffic counters of one network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Datagrams scheduled for delivery
    pub datagrams_sent: u64,
    /// Datagrams discarded by random loss
    pub datagrams_lost: u64,
    /// Datagrams discarded because the sender's in-flight budget was full
    pub datagrams_over_capacity: u64,
    /// Datagrams addressed to nobody
    pub datagrams_unroutable: u64,
    /// Stream segments scheduled for delivery
    pub segments_sent: u64,
    /// Packets and segments handed to a receive buffer
    pub packets_delivered: u64,
    /// Payload bytes handed to receive buffers
    pub bytes_delivered: u64,
    /// Outgoing stream connects that completed
    pub connections_established: u64,
    /// Incoming stream connections accepted by a listener
    pub connections_accepted: u64,
    /// Stream connects that ended in a refusal
    pub connections_refused: u64,
    /// Events the scheduler rejected
    pub events_dropped: u64,
}

impl NetworkStats {
    /// Fraction of attempted datagrams that were discarded.
    pub fn datagram_loss_ratio(&self) -> f64 {
        let discarded =
            self.datagrams_lost + self.datagrams_over_capacity + self.datagrams_unroutable;
        let attempted = self.datagrams_sent + discarded;
        if attempted == 0 {
            return 0.0;
        }
        discarded as f64 / attempted as f64
    }
}

impl fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Datagrams: {} sent, {} lost, {} over capacity, {} unroutable",
            self.datagrams_sent,
            self.datagrams_lost,
            self.datagrams_over_capacity,
            self.datagrams_unroutable
        )?;
        writeln!(f, "Segments: {} sent", self.segments_sent)?;
        writeln!(
            f,
            "Delivered: {} packets, {} bytes",
            self.packets_delivered, self.bytes_delivered
        )?;
        write!(
            f,
            "Connections: {} established, {} accepted, {} refused",
            self.connections_established, self.connections_accepted, self.connections_refused
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_ratio() {
        let stats = NetworkStats {
            datagrams_sent: 90,
            datagrams_lost: 10,
            ..Default::default()
        };
        assert!((stats.datagram_loss_ratio() - 0.1).abs() < f64::EPSILON);
        assert_eq!(NetworkStats::default().datagram_loss_ratio(), 0.0);
    }
}
