//! Virtual sockets.
//!
//! A [`VirtualSocket`] is a handle: an id into the network's socket arena
//! plus a weak back-reference to the network. All state lives inside the
//! network, so a scheduled delivery can never reach a destroyed socket.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use vnet_core::{IpFamily, SocketError};

use crate::network::{NetworkEntry, NetworkState, Packet, Shared};
use crate::notify::{SocketEvent, Subscription};

/// Arena id of a socket. Ids are never reused within a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport a socket emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// Unordered, lossy datagrams
    Datagram,
    /// Ordered, flow-controlled byte stream
    Stream,
}

/// Connection state. A listening stream socket reports `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Not connected; possibly bound
    Closed,
    /// Connect in progress, or listening
    Connecting,
    /// Connected to a remote address
    Connected,
}

/// Socket option keys. Values are stored but have no effect, except
/// `Ipv6Only` which restricts dual-stack interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// Don't-fragment bit
    DontFragment,
    /// Receive buffer size
    ReceiveBuffer,
    /// Send buffer size
    SendBuffer,
    /// Disable Nagle
    NoDelay,
    /// IPv6 socket refuses IPv4 peers
    Ipv6Only,
    /// Differentiated services code point
    Dscp,
}

/// Per-socket state held in the network's arena.
#[derive(Debug)]
pub(crate) struct SocketState {
    pub(crate) family: IpFamily,
    pub(crate) kind: SocketKind,
    pub(crate) blocking: bool,
    pub(crate) state: ConnState,
    /// Normalized bound (or, for accepted sockets, inherited) address
    pub(crate) local: Option<SocketAddr>,
    pub(crate) alternative_local: Option<SocketAddr>,
    pub(crate) remote: Option<SocketAddr>,
    /// True when this socket owns its entry in the binding table
    pub(crate) bound: bool,
    pub(crate) was_any: bool,
    pub(crate) error: Option<SocketError>,
    pub(crate) options: HashMap<SocketOption, i32>,
    pub(crate) listen_queue: Option<VecDeque<SocketAddr>>,
    pub(crate) backlog: usize,
    pub(crate) recv_buffer: VecDeque<Packet>,
    /// Bytes queued or in flight toward this stream socket
    pub(crate) recv_window: usize,
    pub(crate) send_buffer: BytesMut,
    pub(crate) write_enabled: bool,
    pub(crate) network: VecDeque<NetworkEntry>,
    pub(crate) network_size: usize,
    pub(crate) drain_scheduled: bool,
}

impl SocketState {
    pub(crate) fn new(family: IpFamily, kind: SocketKind, blocking: bool) -> Self {
        Self {
            family,
            kind,
            blocking,
            state: ConnState::Closed,
            local: None,
            alternative_local: None,
            remote: None,
            bound: false,
            was_any: false,
            error: None,
            options: HashMap::new(),
            listen_queue: None,
            backlog: 0,
            recv_buffer: VecDeque::new(),
            recv_window: 0,
            send_buffer: BytesMut::new(),
            write_enabled: false,
            network: VecDeque::new(),
            network_size: 0,
            drain_scheduled: false,
        }
    }

    /// Address reported to callers and announced to peers.
    pub(crate) fn local_address(&self) -> Option<SocketAddr> {
        self.alternative_local.or(self.local)
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.listen_queue.is_some()
    }

    pub(crate) fn v6_only(&self) -> bool {
        self.options
            .get(&SocketOption::Ipv6Only)
            .is_some_and(|value| *value != 0)
    }
}

/// Handle to a socket living inside a [`VirtualNetwork`](crate::VirtualNetwork).
///
/// Operations mirror a non-blocking BSD socket. Failures return the error
/// and also record it as the socket's last error. Dropping the handle
/// closes the socket and frees its slot.
pub struct VirtualSocket {
    id: SocketId,
    family: IpFamily,
    kind: SocketKind,
    blocking: bool,
    network: Weak<Shared>,
}

impl VirtualSocket {
    pub(crate) fn new(
        id: SocketId,
        family: IpFamily,
        kind: SocketKind,
        blocking: bool,
        network: Weak<Shared>,
    ) -> Self {
        Self {
            id,
            family,
            kind,
            blocking,
            network,
        }
    }

    /// Arena id of this socket.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Family the socket was created for.
    pub fn family(&self) -> IpFamily {
        self.family
    }

    /// Transport of this socket.
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// True for sockets whose `recv` pumps the scheduler.
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Binds to `addr`. Port 0 picks the next free ephemeral port; the
    /// wildcard IP stays a wildcard binding.
    ///
    /// # Errors
    ///
    /// - `SocketError::AlreadyBound` - Socket already has a local address
    /// - `SocketError::AddressInUse` - Another socket owns the address
    /// - `SocketError::EphemeralPortsExhausted` - Port 0 requested and no port is free
    pub fn bind(&self, addr: SocketAddr) -> Result<(), SocketError> {
        self.with_network(|state| state.bind(self.id, addr).map(|_| ()))
    }

    /// Binds to a fresh test IP of this socket's family from the network's
    /// address cursor.
    ///
    /// # Errors
    ///
    /// - `SocketError::AlreadyBound` - Socket already has a local address
    /// - `SocketError::AddressInUse` - Another socket owns the address
    /// - `SocketError::EphemeralPortsExhausted` - Port 0 requested and no port is free
    pub fn bind_generated(&self, port: u16) -> Result<SocketAddr, SocketError> {
        let family = self.family;
        self.with_network(|state| {
            let ip = state.next_ip(family);
            state.bind(self.id, SocketAddr::new(ip, port))
        })
    }

    /// Connects to `addr`. Datagram sockets connect immediately; stream
    /// sockets start a handshake whose outcome arrives as a `Connected` or
    /// `Closed` notification.
    ///
    /// # Errors
    ///
    /// - `SocketError::HostUnreachable` - Listener's address family cannot interact with ours
    /// - `SocketError::AlreadyConnected` - Socket is connected
    /// - `SocketError::ConnectInProgress` - A stream connect is pending
    /// - `SocketError::InvalidState` - Socket is listening
    /// - `SocketError::AddressInUse` - Implicit bind failed
    pub fn connect(&self, addr: SocketAddr) -> Result<(), SocketError> {
        self.with_network(|state| state.connect(self.id, addr))
    }

    /// Starts listening for stream connections. A positive `backlog` caps
    /// the pending queue; requests beyond it are refused.
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidState` - Not a bound, idle stream socket
    pub fn listen(&self, backlog: usize) -> Result<(), SocketError> {
        self.with_network(|state| state.listen(self.id, backlog))
    }

    /// Accepts the oldest pending connection, returning the connected
    /// socket and the peer's address.
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidState` - Socket is not listening
    /// - `SocketError::WouldBlock` - No connection is pending
    pub fn accept(&self) -> Result<(VirtualSocket, SocketAddr), SocketError> {
        let (child, peer) = self.with_network(|state| state.accept(self.id))?;
        let socket = VirtualSocket::new(child, self.family, SocketKind::Stream, false, self.network.clone());
        Ok((socket, peer))
    }

    /// Sends to the connected peer, returning the number of bytes accepted.
    ///
    /// # Errors
    ///
    /// - `SocketError::NotConnected` - Socket is not connected
    /// - `SocketError::WouldBlock` - Stream send buffer is full
    /// - `SocketError::FrameTooLarge` - Datagram exceeds the maximum payload
    /// - `SocketError::HostUnreachable` - Destination family cannot interact with ours
    pub fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        self.with_network(|state| state.send(self.id, data))
    }

    /// Sends a datagram to `addr`; stream sockets ignore `addr` and send to
    /// their peer.
    ///
    /// # Errors
    ///
    /// - `SocketError::NotConnected` - Stream socket is not connected
    /// - `SocketError::WouldBlock` - Stream send buffer is full
    /// - `SocketError::FrameTooLarge` - Datagram exceeds the maximum payload
    /// - `SocketError::HostUnreachable` - Destination family cannot interact with ours
    /// - `SocketError::AddressInUse` - Implicit bind failed
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        self.with_network(|state| state.send_to(self.id, data, addr))
    }

    /// Reads queued data into `buf`.
    ///
    /// # Errors
    ///
    /// - `SocketError::WouldBlock` - Nothing is queued (for blocking sockets, nothing arrived before the network went idle)
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.recv_from(buf).map(|(read, _)| read)
    }

    /// Reads queued data into `buf` and returns the sender's address.
    ///
    /// # Errors
    ///
    /// - `SocketError::WouldBlock` - Nothing is queued (for blocking sockets, nothing arrived before the network went idle)
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        let shared = self.network.upgrade().ok_or(SocketError::InvalidState)?;
        loop {
            match shared.with_state(|state| state.recv_from(self.id, buf)) {
                Err(SocketError::WouldBlock) if self.blocking => {
                    if !shared.dispatch_next() {
                        return Err(SocketError::WouldBlock);
                    }
                }
                result => return result,
            }
        }
    }

    /// Closes the socket, releasing its address and refusing pending peers.
    ///
    /// # Errors
    ///
    /// - `SocketError::InvalidState` - Socket or network no longer exists
    pub fn close(&self) -> Result<(), SocketError> {
        self.with_network(|state| state.close(self.id))
    }

    /// Reports `addr` as this socket's local address instead of the bound one.
    pub fn configure_alternative_local_address(&self, addr: SocketAddr) {
        let _ = self.with_network(|state| {
            state.socket_mut(self.id)?.alternative_local = Some(addr);
            Ok(())
        });
    }

    /// Stored value of `option`, if set.
    pub fn option(&self, option: SocketOption) -> Option<i32> {
        self.query(|socket| socket.options.get(&option).copied())
            .flatten()
    }

    /// Stores `value` for `option`.
    pub fn configure_option(&self, option: SocketOption, value: i32) {
        let _ = self.with_network(|state| {
            state.socket_mut(self.id)?.options.insert(option, value);
            Ok(())
        });
    }

    /// Largest datagram the path supports.
    ///
    /// # Errors
    ///
    /// - `SocketError::NotConnected` - Socket is not connected
    pub fn estimate_mtu(&self) -> Result<u32, SocketError> {
        self.with_network(|state| state.estimate_mtu(self.id))
    }

    /// Address the socket reports as its own.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.query(SocketState::local_address).flatten()
    }

    /// Connected peer's address.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.query(|socket| socket.remote).flatten()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.query(|socket| socket.state)
            .unwrap_or(ConnState::Closed)
    }

    /// Error of the last failed operation.
    pub fn error(&self) -> Option<SocketError> {
        self.query(|socket| socket.error).flatten()
    }

    /// True once `listen` succeeded and until close.
    pub fn is_listening(&self) -> bool {
        self.query(SocketState::is_listening).unwrap_or(false)
    }

    /// Registers `handler` for this socket's notifications.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SocketEvent) + Send + Sync + 'static,
    {
        match self.network.upgrade() {
            Some(shared) => {
                let id = shared.hub.lock().register(self.id, Arc::new(handler));
                Subscription::new(id, self.network.clone())
            }
            None => Subscription::detached(),
        }
    }

    fn with_network<R>(
        &self,
        f: impl FnOnce(&mut NetworkState) -> Result<R, SocketError>,
    ) -> Result<R, SocketError> {
        let shared = self.network.upgrade().ok_or(SocketError::InvalidState)?;
        shared.with_state(f)
    }

    fn query<R>(&self, f: impl FnOnce(&SocketState) -> R) -> Option<R> {
        let shared = self.network.upgrade()?;
        let state = shared.state.lock();
        state.socket(self.id).ok().map(f)
    }
}

impl Drop for VirtualSocket {
    fn drop(&mut self) {
        if let Some(shared) = self.network.upgrade() {
            shared.with_state(|state| state.destroy_socket(self.id));
            let released = shared.hub.lock().forget_socket(self.id);
            drop(released);
        }
    }
}

impl fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("kind", &self.kind)
            .finish()
    }
}
