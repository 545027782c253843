//! Deterministic execution core: virtual clock, seeded RNG, event scheduler
//! and invariant checking.
//!
//! Same seed and same sequence of socket calls always produce the same
//! deliveries at the same virtual times.

mod clock;
mod events;
mod invariants;
mod scheduler;

pub use clock::{DeterministicClock, DeterministicRng};
pub use events::{EventId, NetworkEvent, ScheduledEvent};
pub use invariants::{
    ConnectionProvenanceInvariant, ConnectionSymmetryInvariant, InFlightCapacityInvariant,
    Invariant, InvariantViolation, ReceiveWindowInvariant, UniqueBindingInvariant,
};
pub use scheduler::{DeterministicScheduler, MAX_EVENT_QUEUE_SIZE, Scheduler, SchedulerError};

#[cfg(test)]
mod tests;
