//! Network-wide tables and the emulation algorithms.
//!
//! Everything here runs under the network lock. Notifications are queued in
//! `notifications` and fired by the caller after the lock is released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use vnet_core::config::MIN_NETWORK_CAPACITY;
use vnet_core::{AddressExt, IpFamily, NetworkConfig, SocketError, SocketPair};

use super::packet::{NetworkEntry, Packet};
use super::snapshot::{NetworkSnapshot, SocketSnapshot};
use super::stats::NetworkStats;
use super::{
    ESTIMATED_MTU, FIRST_EPHEMERAL_PORT, LAST_EPHEMERAL_PORT, MAX_DATAGRAM_PAYLOAD,
    TCP_HEADER_SIZE, TCP_MSS, UDP_HEADER_SIZE,
};
use crate::delay::DelayModel;
use crate::deterministic::{
    DeterministicRng, Invariant, InvariantViolation, NetworkEvent, ScheduledEvent, Scheduler,
};
use crate::notify::SocketEvent;
use crate::socket::{ConnState, SocketId, SocketKind, SocketState};

const EPHEMERAL_PORT_COUNT: usize = (LAST_EPHEMERAL_PORT - FIRST_EPHEMERAL_PORT) as usize + 1;
const INITIAL_NEXT_IPV4: Ipv4Addr = Ipv4Addr::new(1, 0, 0, 0);
const INITIAL_NEXT_IPV6: Ipv6Addr = Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 2);

/// Local-address view of a socket for the dual-stack compatibility rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Endpoint {
    /// Reported local IP (alternative address if configured)
    pub(crate) ip: IpAddr,
    /// Socket was bound to a wildcard
    pub(crate) was_any: bool,
    /// Socket refuses IPv4 peers
    pub(crate) v6_only: bool,
}

/// Decides whether two sockets may exchange traffic across address families.
///
/// Same family after normalization always works. An IPv4 socket reaches an
/// IPv6 wildcard unless that socket is v6-only, and a socket bound to the
/// IPv6 wildcard talks to anyone.
pub(crate) fn can_interact(local: &Endpoint, remote: &Endpoint) -> bool {
    if local.ip.normalized().family() == remote.ip.normalized().family() {
        return true;
    }
    if local.ip.family() == IpFamily::V4 && !remote.v6_only && remote.ip.is_any_ip() {
        return true;
    }
    if remote.ip.family() == IpFamily::V4 && !local.v6_only && local.ip.is_any_ip() {
        return true;
    }
    if local.ip.family() == IpFamily::V6 && local.was_any {
        return true;
    }
    remote.ip.family() == IpFamily::V6 && remote.was_any
}

pub(crate) struct NetworkState {
    config: NetworkConfig,
    scheduler: Box<dyn Scheduler>,
    rng: DeterministicRng,
    delay: DelayModel,
    sockets: HashMap<SocketId, SocketState>,
    next_socket_id: u64,
    bindings: HashMap<SocketAddr, SocketId>,
    connections: HashMap<SocketPair, SocketId>,
    ever_bound: HashSet<SocketAddr>,
    next_port: u16,
    next_ipv4: Ipv4Addr,
    next_ipv6: Ipv6Addr,
    /// Latest delivery time handed out; ordered traffic never lands before it
    watermark: Instant,
    stats: NetworkStats,
    invariants: Vec<Arc<dyn Invariant>>,
    notifications: Vec<(SocketId, SocketEvent)>,
}

impl NetworkState {
    pub(crate) fn new(
        mut config: NetworkConfig,
        scheduler: Box<dyn Scheduler>,
        invariants: Vec<Arc<dyn Invariant>>,
    ) -> Self {
        config.drop_probability = config.drop_probability.clamp(0.0, 1.0);
        config.network_capacity = usable_capacity(config.network_capacity);
        let delay = DelayModel::build(
            config.delay_mean_ms,
            config.delay_stddev_ms,
            config.delay_samples,
        );
        let next_port = match config.first_ephemeral_port {
            Some(port) if port != 0 => port,
            _ => FIRST_EPHEMERAL_PORT,
        };
        let watermark = scheduler.now();

        Self {
            rng: DeterministicRng::from_seed(config.seed),
            config,
            scheduler,
            delay,
            sockets: HashMap::new(),
            next_socket_id: 1,
            bindings: HashMap::new(),
            connections: HashMap::new(),
            ever_bound: HashSet::new(),
            next_port,
            next_ipv4: INITIAL_NEXT_IPV4,
            next_ipv6: INITIAL_NEXT_IPV6,
            watermark,
            stats: NetworkStats::default(),
            invariants,
            notifications: Vec::new(),
        }
    }

    pub(crate) fn socket(&self, id: SocketId) -> Result<&SocketState, SocketError> {
        self.sockets.get(&id).ok_or(SocketError::InvalidState)
    }

    pub(crate) fn socket_mut(&mut self, id: SocketId) -> Result<&mut SocketState, SocketError> {
        self.sockets.get_mut(&id).ok_or(SocketError::InvalidState)
    }

    pub(crate) fn take_notifications(&mut self) -> Vec<(SocketId, SocketEvent)> {
        std::mem::take(&mut self.notifications)
    }

    fn notify(&mut self, id: SocketId, event: SocketEvent) {
        self.notifications.push((id, event));
    }

    fn record<T>(&mut self, id: SocketId, result: Result<T, SocketError>) -> Result<T, SocketError> {
        if let Err(error) = &result {
            if let Some(socket) = self.sockets.get_mut(&id) {
                socket.error = Some(*error);
            }
        }
        result
    }

    // Scheduling

    fn post_at(&mut self, at: Instant, target: SocketId, event: NetworkEvent) -> bool {
        let kind = event.as_str();
        match self.scheduler.post_at(at, target, event) {
            Ok(_) => true,
            Err(error) => {
                self.stats.events_dropped += 1;
                warn!(socket = %target, event = kind, %error, "Dropping scheduled event");
                false
            }
        }
    }

    fn post(&mut self, target: SocketId, event: NetworkEvent) -> bool {
        let now = self.scheduler.now();
        self.post_at(now, target, event)
    }

    fn post_delayed(&mut self, delay_ms: u32, target: SocketId, event: NetworkEvent) -> bool {
        let at = self.scheduler.now() + Duration::from_millis(u64::from(delay_ms));
        self.post_at(at, target, event)
    }

    /// Schedules a disconnect for `target` after one sampled transit delay.
    fn disconnect(&mut self, target: Option<SocketId>) {
        if let Some(target) = target {
            let delay = self.delay.sample(&mut self.rng);
            self.post_delayed(delay, target, NetworkEvent::Disconnect);
        }
    }

    pub(crate) fn now(&self) -> Instant {
        self.scheduler.now()
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.scheduler.now() - self.scheduler.start_time()
    }

    pub(crate) fn pending_events(&self) -> usize {
        self.scheduler.pending()
    }

    pub(crate) fn advance_to(&mut self, deadline: Instant) {
        if deadline <= self.scheduler.now() {
            return;
        }
        if let Err(error) = self.scheduler.advance_to(deadline) {
            warn!(%error, "Failed to advance virtual time");
        }
    }

    /// Dispatches the next event if it is due by `deadline`. Returns the
    /// invariant violations observed afterwards, or `None` when nothing was
    /// dispatched.
    pub(crate) fn dispatch_next(
        &mut self,
        deadline: Option<Instant>,
    ) -> Option<Vec<InvariantViolation>> {
        let due = self.scheduler.peek_time()?;
        if deadline.is_some_and(|deadline| due > deadline) {
            return None;
        }
        let event = self.scheduler.next_event()?;
        self.dispatch(event);
        Some(self.check_invariants(false))
    }

    fn dispatch(&mut self, scheduled: ScheduledEvent) {
        let id = scheduled.target;
        let Some(socket) = self.sockets.get_mut(&id) else {
            debug!(socket = %id, event = scheduled.event.as_str(), "Ignoring event for destroyed socket");
            return;
        };
        trace!(socket = %id, event = scheduled.event.as_str(), "Dispatching");

        match scheduled.event {
            NetworkEvent::PacketArrived(packet) => {
                self.stats.packets_delivered += 1;
                self.stats.bytes_delivered += packet.len() as u64;
                socket.recv_buffer.push_back(packet);
                self.notify(id, SocketEvent::Readable);
            }
            NetworkEvent::ConnectRequest { from } => self.on_connect_request(id, from),
            NetworkEvent::Disconnect => {
                if socket.state == ConnState::Closed {
                    return;
                }
                let error = if socket.state == ConnState::Connecting {
                    self.stats.connections_refused += 1;
                    Some(SocketError::ConnectionRefused)
                } else {
                    None
                };
                socket.state = ConnState::Closed;
                socket.remote = None;
                debug!(socket = %id, ?error, "Disconnected");
                self.notify(id, SocketEvent::Closed(error));
            }
            NetworkEvent::AddressBound => {
                if let Some(addr) = socket.local_address() {
                    self.notify(id, SocketEvent::AddressReady(addr));
                }
            }
            NetworkEvent::DrainSendBuffer => {
                socket.drain_scheduled = false;
                self.drain_send_buffer(id);
            }
        }
    }

    fn on_connect_request(&mut self, id: SocketId, from: SocketAddr) {
        let Some(socket) = self.sockets.get_mut(&id) else {
            return;
        };
        let backlog = socket.backlog;

        if let Some(queue) = socket.listen_queue.as_mut() {
            if backlog > 0 && queue.len() >= backlog {
                debug!(socket = %id, %from, backlog, "Backlog full, refusing connection");
                let target = self.lookup_binding(from);
                self.disconnect(target);
            } else {
                queue.push_back(from);
                self.notify(id, SocketEvent::Readable);
            }
            return;
        }

        if socket.kind == SocketKind::Stream && socket.state == ConnState::Connecting {
            self.complete_connect(id, from, true);
            return;
        }

        debug!(socket = %id, %from, "Socket not listening, refusing connection");
        let local = socket.local;
        let target = match local.map(|local| SocketPair::new(local, from)) {
            Some(key) if self.connections.contains_key(&key) => self.connections.remove(&key),
            _ => self.lookup_binding(from),
        };
        self.disconnect(target);
    }

    fn complete_connect(&mut self, id: SocketId, remote: SocketAddr, notify: bool) {
        let Some(socket) = self.sockets.get_mut(&id) else {
            return;
        };
        socket.remote = Some(remote);
        socket.state = ConnState::Connected;
        if let Some(local) = socket.local {
            self.connections.insert(SocketPair::new(remote, local), id);
        }
        if notify {
            self.stats.connections_established += 1;
            debug!(socket = %id, %remote, "Connected");
            self.notify(id, SocketEvent::Connected);
        }
    }

    // Socket lifecycle

    pub(crate) fn create_socket(
        &mut self,
        family: IpFamily,
        kind: SocketKind,
        blocking: bool,
    ) -> SocketId {
        let id = SocketId(self.next_socket_id);
        self.next_socket_id += 1;
        self.sockets
            .insert(id, SocketState::new(family, kind, blocking));
        trace!(socket = %id, ?kind, %family, "Created socket");
        id
    }

    /// Closes and removes a socket whose handle was dropped.
    pub(crate) fn destroy_socket(&mut self, id: SocketId) {
        if self.close_inner(id).is_ok() {
            self.sockets.remove(&id);
            trace!(socket = %id, "Destroyed socket");
        }
    }

    pub(crate) fn bind(&mut self, id: SocketId, addr: SocketAddr) -> Result<SocketAddr, SocketError> {
        let result = self.bind_inner(id, addr);
        self.record(id, result)
    }

    fn bind_inner(&mut self, id: SocketId, addr: SocketAddr) -> Result<SocketAddr, SocketError> {
        if self.socket(id)?.local.is_some() {
            return Err(SocketError::AlreadyBound);
        }

        let mut normalized = addr.normalized();
        if normalized.port() == 0 {
            let port = self.allocate_port(normalized.ip())?;
            normalized.set_port(port);
        }
        if self.bindings.contains_key(&normalized) {
            return Err(SocketError::AddressInUse);
        }

        self.bindings.insert(normalized, id);
        self.ever_bound.insert(normalized);
        let socket = self.socket_mut(id)?;
        socket.local = Some(normalized);
        socket.bound = true;
        socket.was_any = addr.is_any_ip();
        debug!(socket = %id, address = %normalized, "Bound");
        self.post(id, NetworkEvent::AddressBound);
        Ok(normalized)
    }

    fn allocate_port(&mut self, ip: IpAddr) -> Result<u16, SocketError> {
        for _ in 0..EPHEMERAL_PORT_COUNT {
            let port = self.next_port;
            self.next_port = if port >= LAST_EPHEMERAL_PORT {
                FIRST_EPHEMERAL_PORT
            } else {
                port + 1
            };
            if !self.bindings.contains_key(&SocketAddr::new(ip, port)) {
                return Ok(port);
            }
        }
        warn!(%ip, "Ephemeral port range exhausted");
        Err(SocketError::EphemeralPortsExhausted)
    }

    fn unbind(&mut self, id: SocketId, addr: SocketAddr) {
        let key = addr.normalized();
        if self.bindings.get(&key) == Some(&id) {
            self.bindings.remove(&key);
        }
    }

    /// Finds the socket bound to `addr`. An address equal to the family's
    /// default route also matches a wildcard binding on the same port.
    pub(crate) fn lookup_binding(&self, addr: SocketAddr) -> Option<SocketId> {
        if let Some(id) = self.bindings.get(&addr.normalized()) {
            return Some(*id);
        }
        match self.default_route(addr.family()) {
            Some(route) if route == addr.ip() => {
                let wildcard = SocketAddr::new(addr.family().any_ip(), addr.port());
                self.bindings.get(&wildcard).copied()
            }
            _ => None,
        }
    }

    fn endpoint(&self, id: SocketId) -> Option<Endpoint> {
        let socket = self.sockets.get(&id)?;
        let ip = socket.local_address()?.ip();
        Some(Endpoint {
            ip,
            was_any: socket.was_any,
            v6_only: socket.v6_only(),
        })
    }

    fn sockets_interact(&self, local: SocketId, remote: SocketId) -> bool {
        match (self.endpoint(local), self.endpoint(remote)) {
            (Some(local), Some(remote)) => can_interact(&local, &remote),
            _ => false,
        }
    }

    pub(crate) fn connect(&mut self, id: SocketId, addr: SocketAddr) -> Result<(), SocketError> {
        let result = self.connect_inner(id, addr);
        self.record(id, result)
    }

    fn connect_inner(&mut self, id: SocketId, addr: SocketAddr) -> Result<(), SocketError> {
        let socket = self.socket(id)?;
        if socket.is_listening() {
            return Err(SocketError::InvalidState);
        }
        match socket.state {
            ConnState::Connected => return Err(SocketError::AlreadyConnected),
            ConnState::Connecting => return Err(SocketError::ConnectInProgress),
            ConnState::Closed => {}
        }
        let kind = socket.kind;
        if socket.local.is_none() {
            self.bind_inner(id, addr.family().any_address())?;
        }

        if kind == SocketKind::Datagram {
            let socket = self.socket_mut(id)?;
            socket.remote = Some(addr);
            socket.state = ConnState::Connected;
            return Ok(());
        }

        self.initiate_stream_connect(id, addr)?;
        self.socket_mut(id)?.state = ConnState::Connecting;
        Ok(())
    }

    fn initiate_stream_connect(&mut self, id: SocketId, addr: SocketAddr) -> Result<(), SocketError> {
        let delay = self.delay.sample(&mut self.rng);
        let from = self
            .socket(id)?
            .local_address()
            .ok_or(SocketError::InvalidState)?;

        match self.lookup_binding(addr) {
            Some(remote) => {
                if !self.sockets_interact(id, remote) {
                    info!(socket = %id, %addr, "Address family mismatch between sockets");
                    return Err(SocketError::HostUnreachable);
                }
                self.post_delayed(delay, remote, NetworkEvent::ConnectRequest { from });
            }
            None => {
                debug!(socket = %id, %addr, "Nobody bound at destination, refusing connect");
                self.post_delayed(delay, id, NetworkEvent::Disconnect);
            }
        }
        Ok(())
    }

    pub(crate) fn listen(&mut self, id: SocketId, backlog: usize) -> Result<(), SocketError> {
        let result = self.listen_inner(id, backlog);
        self.record(id, result)
    }

    fn listen_inner(&mut self, id: SocketId, backlog: usize) -> Result<(), SocketError> {
        let socket = self.socket_mut(id)?;
        if socket.kind != SocketKind::Stream
            || !socket.bound
            || socket.state != ConnState::Closed
            || socket.is_listening()
        {
            return Err(SocketError::InvalidState);
        }
        socket.listen_queue = Some(VecDeque::new());
        socket.backlog = backlog;
        socket.state = ConnState::Connecting;
        debug!(socket = %id, backlog, "Listening");
        Ok(())
    }

    pub(crate) fn accept(&mut self, id: SocketId) -> Result<(SocketId, SocketAddr), SocketError> {
        let result = self.accept_inner(id);
        self.record(id, result)
    }

    fn accept_inner(&mut self, id: SocketId) -> Result<(SocketId, SocketAddr), SocketError> {
        let listener = self.socket(id)?;
        if !listener.is_listening() {
            return Err(SocketError::InvalidState);
        }
        let family = listener.family;
        let was_any = listener.was_any;
        let local = listener.local.ok_or(SocketError::InvalidState)?;

        loop {
            let next = self
                .socket_mut(id)?
                .listen_queue
                .as_mut()
                .and_then(VecDeque::pop_front);
            let Some(peer_addr) = next else {
                return Err(SocketError::WouldBlock);
            };

            let Some(peer) = self.lookup_binding(peer_addr) else {
                debug!(socket = %id, peer = %peer_addr, "Pending peer went away");
                continue;
            };
            let child_view = Endpoint {
                ip: local.ip(),
                was_any,
                v6_only: false,
            };
            let compatible = self
                .endpoint(peer)
                .is_some_and(|peer_view| can_interact(&child_view, &peer_view));
            if !compatible {
                debug!(socket = %id, peer = %peer_addr, "Skipping incompatible peer");
                continue;
            }

            let child = self.create_socket(family, SocketKind::Stream, false);
            let socket = self.socket_mut(child)?;
            socket.local = Some(local);
            socket.was_any = was_any;
            if !self.post(peer, NetworkEvent::ConnectRequest { from: local }) {
                self.sockets.remove(&child);
                continue;
            }
            self.complete_connect(child, peer_addr, false);
            self.stats.connections_accepted += 1;
            debug!(socket = %id, child = %child, peer = %peer_addr, "Accepted connection");
            return Ok((child, peer_addr));
        }
    }

    pub(crate) fn close(&mut self, id: SocketId) -> Result<(), SocketError> {
        let result = self.close_inner(id);
        self.record(id, result)
    }

    fn close_inner(&mut self, id: SocketId) -> Result<(), SocketError> {
        let socket = self.socket_mut(id)?;
        let kind = socket.kind;
        let state = socket.state;
        let local = socket.local;
        let remote = socket.remote;
        let bound = socket.bound;
        let listen_queue = socket.listen_queue.take();
        socket.bound = false;

        if bound {
            if let Some(local) = local {
                self.unbind(id, local);
            }
        }

        if kind == SocketKind::Stream {
            for pending in listen_queue.into_iter().flatten() {
                let target = self.lookup_binding(pending);
                self.disconnect(target);
            }

            if let (ConnState::Connected, Some(local), Some(remote)) = (state, local, remote) {
                let peer = self
                    .connections
                    .get(&SocketPair::new(local, remote))
                    .copied()
                    .or_else(|| self.lookup_binding(remote));
                self.disconnect(peer);
                self.connections.remove(&SocketPair::new(remote, local));
                self.connections.remove(&SocketPair::new(local, remote));
            }
        }

        let cancelled = self.scheduler.cancel_all_for(id);
        if let (SocketKind::Stream, Some(local)) = (kind, local) {
            for event in cancelled {
                if let NetworkEvent::ConnectRequest { from } = event.event {
                    let key = SocketPair::new(local, from);
                    match self.connections.remove(&key) {
                        Some(peer) => self.disconnect(Some(peer)),
                        None => {
                            let target = self.lookup_binding(from);
                            self.disconnect(target);
                        }
                    }
                }
            }
        }

        let socket = self.socket_mut(id)?;
        socket.state = ConnState::Closed;
        socket.local = None;
        socket.remote = None;
        socket.recv_buffer.clear();
        socket.recv_window = 0;
        socket.send_buffer.clear();
        socket.write_enabled = false;
        socket.network.clear();
        socket.network_size = 0;
        socket.drain_scheduled = false;
        debug!(socket = %id, "Closed");
        Ok(())
    }

    /// Closes the socket owning the stream `local -> remote` as if its peer
    /// had gone away.
    pub(crate) fn close_tcp_connection(&mut self, local: SocketAddr, remote: SocketAddr) -> bool {
        let Some(id) = self.connections.get(&SocketPair::new(remote, local)).copied() else {
            return false;
        };
        self.notify(id, SocketEvent::Closed(None));
        if let Err(error) = self.close_inner(id) {
            debug!(socket = %id, %error, "Connection vanished while closing");
        }
        true
    }

    // Data path

    pub(crate) fn send(&mut self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        let result = self.send_inner(id, data);
        self.record(id, result)
    }

    fn send_inner(&mut self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        let socket = self.socket(id)?;
        if socket.state != ConnState::Connected {
            return Err(SocketError::NotConnected);
        }
        match (socket.kind, socket.remote) {
            (SocketKind::Datagram, Some(remote)) => self.send_udp(id, data, remote),
            (SocketKind::Datagram, None) => Err(SocketError::NotConnected),
            (SocketKind::Stream, _) => self.send_stream(id, data),
        }
    }

    pub(crate) fn send_to(
        &mut self,
        id: SocketId,
        data: &[u8],
        addr: SocketAddr,
    ) -> Result<usize, SocketError> {
        let result = match self.socket(id).map(|socket| socket.kind) {
            Ok(SocketKind::Datagram) => self.send_udp(id, data, addr),
            Ok(SocketKind::Stream) => self.send_inner(id, data),
            Err(error) => Err(error),
        };
        self.record(id, result)
    }

    fn send_udp(&mut self, id: SocketId, data: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        if data.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(SocketError::FrameTooLarge);
        }
        if self.socket(id)?.local.is_none() {
            self.bind_inner(id, addr.family().any_address())?;
        }

        let drop_probability = self.config.drop_probability;
        if drop_probability > 0.0 && self.rng.random_bool(drop_probability) {
            self.stats.datagrams_lost += 1;
            trace!(socket = %id, %addr, bytes = data.len(), "Dropping datagram");
            return Ok(data.len());
        }

        let sender = self.endpoint(id).ok_or(SocketError::InvalidState)?;
        let Some(recipient) = self.lookup_binding(addr) else {
            let destination = Endpoint {
                ip: addr.ip(),
                was_any: false,
                v6_only: false,
            };
            if !can_interact(&sender, &destination) {
                return Err(SocketError::HostUnreachable);
            }
            self.stats.datagrams_unroutable += 1;
            debug!(socket = %id, %addr, "No socket bound at destination, discarding datagram");
            return Ok(data.len());
        };
        if !self.sockets_interact(id, recipient) {
            info!(socket = %id, %addr, "Address family mismatch between sockets");
            return Err(SocketError::HostUnreachable);
        }

        let now = self.scheduler.now();
        let capacity = self.config.network_capacity as usize;
        let socket = self.socket_mut(id)?;
        purge_network(socket, now);
        if socket.network_size + data.len() + UDP_HEADER_SIZE > capacity {
            self.stats.datagrams_over_capacity += 1;
            debug!(socket = %id, %addr, "In-flight capacity exceeded, discarding datagram");
            return Ok(data.len());
        }

        self.inject(id, recipient, Bytes::copy_from_slice(data), UDP_HEADER_SIZE, false);
        self.stats.datagrams_sent += 1;
        Ok(data.len())
    }

    fn send_stream(&mut self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        let send_capacity = self.config.send_buffer_capacity as usize;
        let socket = self.socket_mut(id)?;
        if socket.state != ConnState::Connected {
            return Err(SocketError::NotConnected);
        }
        let room = send_capacity.saturating_sub(socket.send_buffer.len());
        if room == 0 {
            socket.write_enabled = true;
            return Err(SocketError::WouldBlock);
        }
        let accepted = room.min(data.len());
        socket.send_buffer.extend_from_slice(&data[..accepted]);
        self.drain_send_buffer(id);
        Ok(accepted)
    }

    /// Moves buffered stream bytes onto the wire as far as the peer's
    /// receive window and this socket's in-flight budget allow.
    fn drain_send_buffer(&mut self, id: SocketId) {
        let now = self.scheduler.now();
        let network_capacity = self.config.network_capacity as usize;
        let recv_capacity = self.config.recv_buffer_capacity as usize;
        let send_capacity = self.config.send_buffer_capacity as usize;

        let Some(socket) = self.sockets.get_mut(&id) else {
            return;
        };
        let recipient = match (socket.local, socket.remote) {
            (Some(local), Some(remote)) => self.connections.get(&SocketPair::new(local, remote)).copied(),
            _ => None,
        };
        let Some(recipient) = recipient else {
            debug!(socket = %id, "Sending data to no one");
            return;
        };
        purge_network(socket, now);

        loop {
            let Some(window) = self.sockets.get(&recipient).map(|peer| peer.recv_window) else {
                break;
            };
            let Some(socket) = self.sockets.get_mut(&id) else {
                return;
            };
            let wanted = recv_capacity
                .saturating_sub(window)
                .min(TCP_MSS - TCP_HEADER_SIZE)
                .min(socket.send_buffer.len());
            if wanted == 0 {
                break;
            }
            let available = network_capacity
                .saturating_sub(socket.network_size)
                .saturating_sub(TCP_HEADER_SIZE);
            let size = wanted.min(available);
            if size == 0 {
                if !socket.drain_scheduled {
                    if let Some(front) = socket.network.front() {
                        let at = front.done_time;
                        socket.drain_scheduled = true;
                        let scheduled = self.post_at(at, id, NetworkEvent::DrainSendBuffer);
                        if let Some(socket) = self.sockets.get_mut(&id) {
                            socket.drain_scheduled = scheduled;
                        }
                    }
                }
                break;
            }

            let segment = socket.send_buffer.split_to(size).freeze();
            if self.inject(id, recipient, segment, TCP_HEADER_SIZE, true) {
                if let Some(peer) = self.sockets.get_mut(&recipient) {
                    peer.recv_window += size;
                }
            }
            self.stats.segments_sent += 1;
        }

        if let Some(socket) = self.sockets.get_mut(&id) {
            if socket.write_enabled && socket.send_buffer.len() < send_capacity {
                socket.write_enabled = false;
                self.notify(id, SocketEvent::Writable);
            }
        }
    }

    /// Puts `data` on the wire from `sender` to `recipient`. Returns false if
    /// the delivery could not be scheduled.
    fn inject(
        &mut self,
        sender: SocketId,
        recipient: SocketId,
        data: Bytes,
        header_size: usize,
        ordered: bool,
    ) -> bool {
        let now = self.scheduler.now();
        let bandwidth = u64::from(self.config.bandwidth);
        let Some(socket) = self.sockets.get_mut(&sender) else {
            return false;
        };
        let Some(local) = socket.local else {
            return false;
        };

        let size = data.len() + header_size;
        socket.network_size += size;
        let send_delay_ms = if bandwidth == 0 {
            0
        } else {
            1000 * socket.network_size as u64 / bandwidth
        };
        let done_time = now + Duration::from_millis(send_delay_ms);
        socket.network.push_back(NetworkEntry { size, done_time });

        let transit_ms = self.delay.sample(&mut self.rng);
        let from = match self.default_route(local.family()) {
            Some(route) if local.is_any_ip() => SocketAddr::new(route, local.port()),
            _ => local,
        };

        let mut arrival = done_time + Duration::from_millis(u64::from(transit_ms));
        if ordered {
            arrival = arrival.max(self.watermark);
        }
        self.watermark = self.watermark.max(arrival);

        trace!(
            sender = %sender,
            recipient = %recipient,
            bytes = data.len(),
            send_delay_ms,
            transit_ms,
            "Injecting packet"
        );
        self.post_at(arrival, recipient, NetworkEvent::PacketArrived(Packet::new(data, from)))
    }

    pub(crate) fn recv_from(
        &mut self,
        id: SocketId,
        buf: &mut [u8],
    ) -> Result<(usize, SocketAddr), SocketError> {
        let result = self.recv_inner(id, buf);
        self.record(id, result)
    }

    fn recv_inner(&mut self, id: SocketId, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        let socket = self.socket_mut(id)?;
        let Some(packet) = socket.recv_buffer.front_mut() else {
            return Err(SocketError::WouldBlock);
        };

        let read = buf.len().min(packet.len());
        buf[..read].copy_from_slice(&packet.data()[..read]);
        let from = packet.from();
        if read < packet.len() {
            packet.consume(read);
        } else {
            socket.recv_buffer.pop_front();
        }

        if socket.kind == SocketKind::Stream {
            socket.recv_window = socket.recv_window.saturating_sub(read);
            if read > 0 {
                let peer = match (socket.local, socket.remote) {
                    (Some(local), Some(remote)) => self.connections.get(&SocketPair::new(local, remote)).copied(),
                    _ => None,
                };
                let peer_has_data = peer
                    .and_then(|peer| self.sockets.get(&peer))
                    .is_some_and(|peer| !peer.send_buffer.is_empty());
                if let (Some(peer), true) = (peer, peer_has_data) {
                    self.drain_send_buffer(peer);
                }
            }
        }
        Ok((read, from))
    }

    pub(crate) fn estimate_mtu(&mut self, id: SocketId) -> Result<u32, SocketError> {
        let result = match self.socket(id) {
            Ok(socket) if socket.state == ConnState::Connected => Ok(ESTIMATED_MTU),
            Ok(_) => Err(SocketError::NotConnected),
            Err(error) => Err(error),
        };
        self.record(id, result)
    }

    // Configuration

    pub(crate) fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn configure_bandwidth(&mut self, bytes_per_second: u32) {
        self.config.bandwidth = bytes_per_second;
    }

    pub(crate) fn configure_network_capacity(&mut self, bytes: u32) {
        self.config.network_capacity = usable_capacity(bytes);
    }

    pub(crate) fn configure_send_buffer_capacity(&mut self, bytes: u32) {
        self.config.send_buffer_capacity = bytes;
    }

    pub(crate) fn configure_recv_buffer_capacity(&mut self, bytes: u32) {
        self.config.recv_buffer_capacity = bytes;
    }

    pub(crate) fn configure_drop_probability(&mut self, probability: f64) {
        self.config.drop_probability = probability.clamp(0.0, 1.0);
    }

    pub(crate) fn configure_delay(&mut self, mean_ms: u32, stddev_ms: u32, samples: u32) {
        self.config.delay_mean_ms = mean_ms;
        self.config.delay_stddev_ms = stddev_ms;
        self.config.delay_samples = samples;
        self.delay = DelayModel::build(mean_ms, stddev_ms, samples);
    }

    pub(crate) fn configure_default_route(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => self.config.default_route_v4 = Some(v4),
            IpAddr::V6(v6) => self.config.default_route_v6 = Some(v6),
        }
    }

    pub(crate) fn configure_next_port(&mut self, port: u16) {
        self.next_port = if port == 0 { FIRST_EPHEMERAL_PORT } else { port };
    }

    fn default_route(&self, family: IpFamily) -> Option<IpAddr> {
        match family {
            IpFamily::V4 => self.config.default_route_v4.map(IpAddr::V4),
            IpFamily::V6 => self.config.default_route_v6.map(IpAddr::V6),
        }
    }

    /// Hands out the next test IP of `family` and advances the cursor.
    pub(crate) fn next_ip(&mut self, family: IpFamily) -> IpAddr {
        match family {
            IpFamily::V4 => {
                let ip = self.next_ipv4;
                self.next_ipv4 = Ipv4Addr::from(u32::from(ip).wrapping_add(1));
                IpAddr::V4(ip)
            }
            IpFamily::V6 => {
                let ip = self.next_ipv6;
                self.next_ipv6 = Ipv6Addr::from(u128::from(ip).wrapping_add(1));
                IpAddr::V6(ip)
            }
        }
    }

    // Introspection

    pub(crate) fn stats(&self) -> NetworkStats {
        self.stats
    }

    pub(crate) fn seed(&self) -> u64 {
        self.rng.seed()
    }

    pub(crate) fn add_invariant(&mut self, invariant: Arc<dyn Invariant>) {
        self.invariants.push(invariant);
    }

    pub(crate) fn snapshot(&self) -> NetworkSnapshot {
        let mut sockets: Vec<SocketSnapshot> = self
            .sockets
            .iter()
            .map(|(id, socket)| SocketSnapshot {
                id: *id,
                kind: socket.kind,
                family: socket.family,
                state: socket.state,
                listening: socket.is_listening(),
                local: socket.local,
                remote: socket.remote,
                in_flight_bytes: socket.network_size,
                recv_window: socket.recv_window,
                send_buffered: socket.send_buffer.len(),
                queued_packets: socket.recv_buffer.len(),
            })
            .collect();
        sockets.sort_by_key(|socket| socket.id);

        NetworkSnapshot {
            elapsed: self.elapsed(),
            network_capacity: self.config.network_capacity as usize,
            send_buffer_capacity: self.config.send_buffer_capacity as usize,
            recv_buffer_capacity: self.config.recv_buffer_capacity as usize,
            sockets,
            bindings: self.bindings.iter().map(|(addr, id)| (*addr, *id)).collect(),
            connections: self
                .connections
                .iter()
                .map(|(pair, id)| (*pair, *id))
                .collect(),
            ever_bound: self.ever_bound.clone(),
        }
    }

    /// Runs the invariants that apply: per-event ones when `at_rest` is
    /// false, quiescence-only ones when it is true.
    pub(crate) fn check_invariants(&self, at_rest: bool) -> Vec<InvariantViolation> {
        let applicable: Vec<&Arc<dyn Invariant>> = self
            .invariants
            .iter()
            .filter(|invariant| invariant.requires_quiescence() == at_rest)
            .collect();
        if applicable.is_empty() {
            return Vec::new();
        }

        let snapshot = self.snapshot();
        applicable
            .into_iter()
            .filter_map(|invariant| invariant.check(&snapshot).err())
            .inspect(|violation| warn!(%violation, "Invariant violated"))
            .collect()
    }
}

/// Raises a capacity that cannot carry a single segment to the minimum that
/// can, so a stream never stalls with bytes stuck in its send buffer.
fn usable_capacity(bytes: u32) -> u32 {
    if bytes < MIN_NETWORK_CAPACITY {
        warn!(bytes, minimum = MIN_NETWORK_CAPACITY, "Raising network capacity to fit one packet");
        MIN_NETWORK_CAPACITY
    } else {
        bytes
    }
}

/// Releases in-flight entries whose serialization finished by `now`.
fn purge_network(socket: &mut SocketState, now: Instant) {
    while let Some(entry) = socket.network.front() {
        if entry.done_time > now {
            break;
        }
        socket.network_size = socket.network_size.saturating_sub(entry.size);
        socket.network.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(ip: &str, was_any: bool, v6_only: bool) -> Endpoint {
        Endpoint {
            ip: ip.parse().unwrap(),
            was_any,
            v6_only,
        }
    }

    #[test]
    fn test_same_family_after_normalization_interacts() {
        assert!(can_interact(&view("::ffff:1.2.3.4", false, false), &view("5.6.7.8", false, false)));
        assert!(can_interact(&view("::2", false, false), &view("::3", false, false)));
    }

    #[test]
    fn test_ipv4_reaches_ipv6_wildcard_unless_v6_only() {
        let v4 = view("127.0.0.2", false, false);
        // Reports "::" without having been bound to it
        assert!(can_interact(&v4, &view("::", false, false)));
        assert!(!can_interact(&v4, &view("::", false, true)));
        assert!(can_interact(&view("::", false, false), &v4));
        // Binding the wildcard wins over the option
        assert!(can_interact(&v4, &view("::", true, true)));
    }

    #[test]
    fn test_plain_ipv6_cannot_reach_ipv4() {
        assert!(!can_interact(&view("::2", false, false), &view("0.0.0.0", true, false)));
        assert!(!can_interact(&view("127.0.0.2", false, false), &view("::1", false, false)));
    }

    #[test]
    fn test_ipv6_bound_to_wildcard_talks_to_anyone() {
        // Child sockets inherit the listener's wildcard flag but report a
        // concrete IPv6 address.
        assert!(can_interact(&view("::5", true, false), &view("10.0.0.1", false, false)));
        assert!(can_interact(&view("10.0.0.1", false, false), &view("::5", true, false)));
    }

    #[test]
    fn test_capacity_below_one_packet_is_raised() {
        assert_eq!(usable_capacity(0), MIN_NETWORK_CAPACITY);
        assert_eq!(usable_capacity(40), MIN_NETWORK_CAPACITY);
        assert_eq!(usable_capacity(4096), 4096);
    }

    #[test]
    fn test_purge_releases_finished_entries() {
        let now = Instant::now();
        let mut socket = SocketState::new(IpFamily::V4, SocketKind::Stream, false);
        socket.network.push_back(NetworkEntry { size: 100, done_time: now });
        socket.network.push_back(NetworkEntry {
            size: 50,
            done_time: now + Duration::from_millis(5),
        });
        socket.network_size = 150;

        purge_network(&mut socket, now);

        assert_eq!(socket.network_size, 50);
        assert_eq!(socket.network.len(), 1);
    }
}
