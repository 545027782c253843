//! Socket notifications and subscriptions.
//!
//! The network queues notifications while it holds its lock and fires them
//! once the lock is released, so a handler may call back into any socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use vnet_core::SocketError;

use crate::network::Shared;
use crate::socket::{SocketId, VirtualSocket};

/// Something a socket's owner may want to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// Bind completed; carries the address the socket reports as local
    AddressReady(SocketAddr),
    /// Data arrived, or a listener has a pending connection
    Readable,
    /// Send buffer has room again after a `WouldBlock`
    Writable,
    /// Outgoing stream connection completed
    Connected,
    /// Stream closed; `Some` carries the failure such as a refused connect
    Closed(Option<SocketError>),
}

/// Discriminant of a [`SocketEvent`], for matching without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEventKind {
    /// See [`SocketEvent::AddressReady`]
    AddressReady,
    /// See [`SocketEvent::Readable`]
    Readable,
    /// See [`SocketEvent::Writable`]
    Writable,
    /// See [`SocketEvent::Connected`]
    Connected,
    /// See [`SocketEvent::Closed`]
    Closed,
}

impl SocketEvent {
    /// Returns the payload-free kind of this event.
    pub fn kind(&self) -> SocketEventKind {
        match self {
            SocketEvent::AddressReady(_) => SocketEventKind::AddressReady,
            SocketEvent::Readable => SocketEventKind::Readable,
            SocketEvent::Writable => SocketEventKind::Writable,
            SocketEvent::Connected => SocketEventKind::Connected,
            SocketEvent::Closed(_) => SocketEventKind::Closed,
        }
    }
}

pub(crate) type Callback = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SubscriptionId(u64);

/// Registered callbacks, keyed by subscription.
#[derive(Default)]
pub(crate) struct SubscriberHub {
    next_id: u64,
    callbacks: HashMap<SubscriptionId, (SocketId, Callback)>,
}

impl SubscriberHub {
    pub(crate) fn register(&mut self, socket: SocketId, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.callbacks.insert(id, (socket, callback));
        id
    }

    /// Removes a registration. The callback is returned so the caller can
    /// drop it after releasing the hub lock.
    pub(crate) fn unregister(&mut self, id: SubscriptionId) -> Option<Callback> {
        self.callbacks.remove(&id).map(|(_, callback)| callback)
    }

    /// Removes every callback attached to a destroyed socket.
    pub(crate) fn forget_socket(&mut self, socket: SocketId) -> Vec<Callback> {
        let ids: Vec<SubscriptionId> = self
            .callbacks
            .iter()
            .filter(|(_, (target, _))| *target == socket)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.unregister(id))
            .collect()
    }

    /// Callbacks for `socket` in registration order.
    pub(crate) fn callbacks_for(&self, socket: SocketId) -> Vec<Callback> {
        let mut matching: Vec<(SubscriptionId, Callback)> = self
            .callbacks
            .iter()
            .filter(|(_, (target, _))| *target == socket)
            .map(|(id, (_, callback))| (*id, Arc::clone(callback)))
            .collect();
        matching.sort_by_key(|(id, _)| id.0);
        matching.into_iter().map(|(_, callback)| callback).collect()
    }
}

/// Live registration of a notification handler.
///
/// Dropping the subscription unregisters the handler. It is safe to drop it
/// after the socket or the whole network is gone.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    id: SubscriptionId,
    network: Weak<Shared>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, network: Weak<Shared>) -> Self {
        Self { id, network }
    }

    /// A subscription for a socket whose network is already gone.
    pub(crate) fn detached() -> Self {
        Self {
            id: SubscriptionId(u64::MAX),
            network: Weak::new(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.network.upgrade() {
            let released = shared.hub.lock().unregister(self.id);
            drop(released);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id.0).finish()
    }
}

/// Records notifications of monitored sockets for later inspection.
///
/// Checking an event kind consumes the matching records, so consecutive
/// checks observe only what happened in between.
#[derive(Debug, Default)]
pub struct EventLog {
    records: Arc<Mutex<Vec<(SocketId, SocketEvent)>>>,
    subscriptions: Vec<Subscription>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts recording notifications of `socket`.
    pub fn monitor(&mut self, socket: &VirtualSocket) {
        let records = Arc::clone(&self.records);
        let id = socket.id();
        let subscription = socket.subscribe(move |event| {
            records.lock().push((id, *event));
        });
        self.subscriptions.push(subscription);
    }

    /// Returns whether `socket` fired `kind` since the last check, and
    /// forgets those records.
    pub fn check(&self, socket: &VirtualSocket, kind: SocketEventKind) -> bool {
        let id = socket.id();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|(target, event)| !(*target == id && event.kind() == kind));
        records.len() != before
    }

    /// Every recorded, unchecked event of `socket` in firing order.
    pub fn events(&self, socket: &VirtualSocket) -> Vec<SocketEvent> {
        let id = socket.id();
        self.records
            .lock()
            .iter()
            .filter(|(target, _)| *target == id)
            .map(|(_, event)| *event)
            .collect()
    }

    /// Error carried by the most recent unchecked close of `socket`.
    pub fn close_error(&self, socket: &VirtualSocket) -> Option<Option<SocketError>> {
        self.events(socket).into_iter().rev().find_map(|event| match event {
            SocketEvent::Closed(error) => Some(error),
            _ => None,
        })
    }

    /// Number of unchecked records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when no unchecked records remain.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
