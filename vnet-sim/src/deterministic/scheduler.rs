//! Cooperative event scheduler driving the virtual network.

use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::clock::DeterministicClock;
use super::events::{EventId, NetworkEvent, ScheduledEvent};
use crate::socket::SocketId;

/// Maximum number of events that can be scheduled.
pub const MAX_EVENT_QUEUE_SIZE: usize = 100_000;

/// Errors that can occur while scheduling events.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Event queue exceeded maximum capacity
    #[error("Event queue overflow: {count} events scheduled")]
    EventQueueOverflow {
        /// Number of events already queued
        count: usize,
    },

    /// Event could not be scheduled properly
    #[error("Invalid event scheduling: {reason}")]
    InvalidEventScheduling {
        /// Reason why scheduling failed
        reason: String,
    },
}

/// Message-scheduling primitive the network posts its deliveries to.
///
/// Events are dispatched strictly in timestamp order, ties broken by
/// posting order. Pulling the next event advances the scheduler's time to
/// that event's timestamp.
pub trait Scheduler: Send {
    /// Current scheduler time.
    fn now(&self) -> Instant;

    /// Time zero of this scheduler.
    fn start_time(&self) -> Instant;

    /// Queues `event` for `target` at an absolute time. Times in the past
    /// are delivered as soon as possible.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::EventQueueOverflow` - Queue is at capacity
    fn post_at(
        &mut self,
        timestamp: Instant,
        target: SocketId,
        event: NetworkEvent,
    ) -> Result<EventId, SchedulerError>;

    /// Queues `event` for immediate delivery after already queued work.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::EventQueueOverflow` - Queue is at capacity
    fn post(&mut self, target: SocketId, event: NetworkEvent) -> Result<EventId, SchedulerError> {
        let now = self.now();
        self.post_at(now, target, event)
    }

    /// Queues `event` for delivery `delay` from now.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::EventQueueOverflow` - Queue is at capacity
    fn post_delayed(
        &mut self,
        delay: Duration,
        target: SocketId,
        event: NetworkEvent,
    ) -> Result<EventId, SchedulerError> {
        let at = self.now() + delay;
        self.post_at(at, target, event)
    }

    /// Removes every queued event addressed to `target`, returning them in
    /// dispatch order.
    fn cancel_all_for(&mut self, target: SocketId) -> Vec<ScheduledEvent>;

    /// Timestamp of the next event without removing it.
    fn peek_time(&self) -> Option<Instant>;

    /// Removes the next event and moves time forward to its timestamp.
    fn next_event(&mut self) -> Option<ScheduledEvent>;

    /// Moves time forward without dispatching anything.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidEventScheduling` - If target time is in the past
    fn advance_to(&mut self, target: Instant) -> Result<(), SchedulerError>;

    /// Number of queued events.
    fn pending(&self) -> usize;

    /// True when nothing is queued.
    fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

/// Min-heap scheduler over a virtual clock.
#[derive(Debug, Default)]
pub struct DeterministicScheduler {
    clock: DeterministicClock,
    queue: BinaryHeap<ScheduledEvent>,
    next_event_id: u64,
}

impl DeterministicScheduler {
    /// Creates an empty scheduler at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns elapsed virtual time.
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }
}

impl Scheduler for DeterministicScheduler {
    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn start_time(&self) -> Instant {
        self.clock.start()
    }

    fn post_at(
        &mut self,
        timestamp: Instant,
        target: SocketId,
        event: NetworkEvent,
    ) -> Result<EventId, SchedulerError> {
        if self.queue.len() >= MAX_EVENT_QUEUE_SIZE {
            return Err(SchedulerError::EventQueueOverflow {
                count: self.queue.len(),
            });
        }

        let id = EventId(self.next_event_id);
        self.next_event_id += 1;

        self.queue.push(ScheduledEvent {
            id,
            timestamp: timestamp.max(self.clock.now()),
            target,
            event,
        });
        Ok(id)
    }

    fn cancel_all_for(&mut self, target: SocketId) -> Vec<ScheduledEvent> {
        let (mut cancelled, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_vec()
            .into_iter()
            .partition(|event| event.target == target);
        self.queue = BinaryHeap::from(kept);

        // Reversed Ord: sorting descending yields dispatch order
        cancelled.sort_by(|a, b| b.cmp(a));
        cancelled
    }

    fn peek_time(&self) -> Option<Instant> {
        self.queue.peek().map(|event| event.timestamp)
    }

    fn next_event(&mut self) -> Option<ScheduledEvent> {
        let event = self.queue.pop()?;
        if event.timestamp > self.clock.now() {
            // Queue timestamps are clamped to the clock, so this cannot fail
            let _ = self.clock.advance_to(event.timestamp);
        }
        Some(event)
    }

    fn advance_to(&mut self, target: Instant) -> Result<(), SchedulerError> {
        self.clock.advance_to(target)
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_dispatch_in_time_order() {
        let mut scheduler = DeterministicScheduler::new();
        let target = SocketId(1);

        scheduler
            .post_delayed(Duration::from_millis(30), target, NetworkEvent::Disconnect)
            .unwrap();
        scheduler
            .post_delayed(Duration::from_millis(10), target, NetworkEvent::AddressBound)
            .unwrap();
        scheduler.post(target, NetworkEvent::DrainSendBuffer).unwrap();

        let first = scheduler.next_event().unwrap();
        assert_eq!(first.event, NetworkEvent::DrainSendBuffer);
        assert_eq!(scheduler.elapsed(), Duration::ZERO);

        let second = scheduler.next_event().unwrap();
        assert_eq!(second.event, NetworkEvent::AddressBound);
        assert_eq!(scheduler.elapsed(), Duration::from_millis(10));

        let third = scheduler.next_event().unwrap();
        assert_eq!(third.event, NetworkEvent::Disconnect);
        assert_eq!(scheduler.elapsed(), Duration::from_millis(30));

        assert!(scheduler.is_idle());
        assert!(scheduler.next_event().is_none());
    }

    #[test]
    fn test_past_timestamp_is_clamped_to_now() {
        let mut scheduler = DeterministicScheduler::new();
        let start = scheduler.now();
        scheduler
            .advance_to(start + Duration::from_millis(100))
            .unwrap();

        scheduler
            .post_at(start, SocketId(1), NetworkEvent::Disconnect)
            .unwrap();

        assert_eq!(scheduler.peek_time(), Some(scheduler.now()));
    }

    #[test]
    fn test_cancel_all_for_returns_events_in_dispatch_order() {
        let mut scheduler = DeterministicScheduler::new();
        let a = SocketId(1);
        let b = SocketId(2);

        scheduler
            .post_delayed(Duration::from_millis(20), a, NetworkEvent::Disconnect)
            .unwrap();
        scheduler
            .post_delayed(Duration::from_millis(5), b, NetworkEvent::Disconnect)
            .unwrap();
        scheduler
            .post_delayed(Duration::from_millis(5), a, NetworkEvent::AddressBound)
            .unwrap();

        let cancelled = scheduler.cancel_all_for(a);

        assert_eq!(cancelled.len(), 2);
        assert_eq!(cancelled[0].event, NetworkEvent::AddressBound);
        assert_eq!(cancelled[1].event, NetworkEvent::Disconnect);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.next_event().unwrap().target, b);
    }

    #[test]
    fn test_queue_overflow_is_rejected() {
        let mut scheduler = DeterministicScheduler::new();
        for _ in 0..MAX_EVENT_QUEUE_SIZE {
            scheduler.post(SocketId(1), NetworkEvent::Disconnect).unwrap();
        }

        let result = scheduler.post(SocketId(1), NetworkEvent::Disconnect);
        assert_eq!(
            result,
            Err(SchedulerError::EventQueueOverflow {
                count: MAX_EVENT_QUEUE_SIZE
            })
        );
    }
}
