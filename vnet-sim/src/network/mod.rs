//! The virtual network: socket arena, tables and the processing loop.

mod packet;
mod snapshot;
mod state;
mod stats;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};
use vnet_core::{IpFamily, NetworkConfig};

pub use packet::{NetworkEntry, Packet};
pub use snapshot::{NetworkSnapshot, SocketSnapshot};
pub(crate) use state::NetworkState;
pub use stats::NetworkStats;

use crate::deterministic::{DeterministicScheduler, Invariant, InvariantViolation, Scheduler};
use crate::notify::{SocketEvent, SubscriberHub};
use crate::socket::{SocketId, SocketKind, VirtualSocket};

/// First port handed out for port-0 binds.
pub const FIRST_EPHEMERAL_PORT: u16 = 49152;
/// Last ephemeral port before the cursor wraps.
pub const LAST_EPHEMERAL_PORT: u16 = 65535;
/// IP plus UDP header bytes charged per datagram.
pub const UDP_HEADER_SIZE: usize = 28;
/// IP plus TCP header bytes charged per stream segment.
pub const TCP_HEADER_SIZE: usize = 40;
/// Maximum stream segment size including the header.
pub const TCP_MSS: usize = 1400;
/// Largest datagram payload accepted by `send_to`.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65507;
/// MTU reported for connected sockets.
pub const ESTIMATED_MTU: u32 = 65536;

/// State shared between the network and its socket handles.
pub(crate) struct Shared {
    pub(crate) state: Mutex<NetworkState>,
    pub(crate) hub: Mutex<SubscriberHub>,
}

impl Shared {
    /// Runs `f` under the network lock, then fires the notifications it
    /// produced with the lock released.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut NetworkState) -> R) -> R {
        let (result, notifications) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, state.take_notifications())
        };
        self.fire(notifications);
        result
    }

    fn fire(&self, notifications: Vec<(SocketId, SocketEvent)>) {
        for (socket, event) in notifications {
            let callbacks = self.hub.lock().callbacks_for(socket);
            for callback in callbacks {
                callback(&event);
            }
        }
    }

    /// Dispatches one event regardless of its due time. Returns false when
    /// the scheduler is idle.
    pub(crate) fn dispatch_next(&self) -> bool {
        self.with_state(|state| state.dispatch_next(None)).is_some()
    }
}

/// Outcome of a processing call.
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    /// Number of events dispatched
    pub events_processed: u64,
    /// Virtual time that passed
    pub elapsed: Duration,
    /// Invariant violations observed while processing
    pub violations: Vec<InvariantViolation>,
}

impl ProcessReport {
    /// True when no invariant was violated.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

impl fmt::Display for ProcessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} events in {:?} of virtual time, {} violations",
            self.events_processed,
            self.elapsed,
            self.violations.len()
        )
    }
}

/// Deterministic in-process network of virtual sockets.
///
/// Sockets created here exchange datagrams and streams with simulated
/// latency, bandwidth, loss and flow control. Nothing moves until the
/// network is processed: every delivery is an event on a virtual-time
/// scheduler, and the same seed always yields the same run.
///
/// Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct VirtualNetwork {
    shared: Arc<Shared>,
}

impl VirtualNetwork {
    /// Creates a network over the deterministic scheduler.
    pub fn new(config: NetworkConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Creates builder for configuring the network.
    pub fn builder() -> VirtualNetworkBuilder {
        VirtualNetworkBuilder::new()
    }

    /// Creates an unbound non-blocking socket.
    pub fn create_socket(&self, family: IpFamily, kind: SocketKind) -> VirtualSocket {
        self.socket_with(family, kind, false)
    }

    /// Creates an unbound datagram socket whose `recv` pumps the scheduler
    /// until data arrives or the network goes idle.
    pub fn create_blocking_socket(&self, family: IpFamily) -> VirtualSocket {
        self.socket_with(family, SocketKind::Datagram, true)
    }

    fn socket_with(&self, family: IpFamily, kind: SocketKind, blocking: bool) -> VirtualSocket {
        let id = self
            .shared
            .with_state(|state| state.create_socket(family, kind, blocking));
        VirtualSocket::new(id, family, kind, blocking, Arc::downgrade(&self.shared))
    }

    /// Dispatches events until none remain, then checks the invariants that
    /// only hold at rest.
    pub fn process_messages_until_idle(&self) -> ProcessReport {
        let start = self.elapsed();
        let mut report = ProcessReport::default();

        while let Some(violations) = self.shared.with_state(|state| state.dispatch_next(None)) {
            report.events_processed += 1;
            report.violations.extend(violations);
        }
        report
            .violations
            .extend(self.shared.with_state(|state| state.check_invariants(true)));

        report.elapsed = self.elapsed() - start;
        report
    }

    /// Dispatches every event due within `duration`, then moves virtual time
    /// to the end of the window.
    pub fn process_for(&self, duration: Duration) -> ProcessReport {
        let start = self.elapsed();
        let deadline = self.now() + duration;
        let mut report = ProcessReport::default();

        while let Some(violations) = self
            .shared
            .with_state(|state| state.dispatch_next(Some(deadline)))
        {
            report.events_processed += 1;
            report.violations.extend(violations);
        }
        self.shared.with_state(|state| state.advance_to(deadline));

        report.elapsed = self.elapsed() - start;
        report
    }

    /// Dispatches the single next event. Returns false when idle.
    pub fn process_next_event(&self) -> bool {
        self.shared.dispatch_next()
    }

    /// Current virtual time.
    pub fn now(&self) -> Instant {
        self.shared.state.lock().now()
    }

    /// Virtual time since the network was created.
    pub fn elapsed(&self) -> Duration {
        self.shared.state.lock().elapsed()
    }

    /// Number of queued events.
    pub fn pending_events(&self) -> usize {
        self.shared.state.lock().pending_events()
    }

    /// Current parameters, including runtime changes.
    pub fn config(&self) -> NetworkConfig {
        self.shared.state.lock().config().clone()
    }

    /// Seed of the network's random source.
    pub fn seed(&self) -> u64 {
        self.shared.state.lock().seed()
    }

    /// Sets the aggregate bandwidth in bytes per second (0 = unlimited).
    pub fn configure_bandwidth(&self, bytes_per_second: u32) {
        self.shared
            .state
            .lock()
            .configure_bandwidth(bytes_per_second);
    }

    /// Sets the per-socket in-flight budget.
    pub fn configure_network_capacity(&self, bytes: u32) {
        self.shared.state.lock().configure_network_capacity(bytes);
    }

    /// Sets the stream send buffer size.
    pub fn configure_send_buffer_capacity(&self, bytes: u32) {
        self.shared
            .state
            .lock()
            .configure_send_buffer_capacity(bytes);
    }

    /// Sets the stream receive window size.
    pub fn configure_recv_buffer_capacity(&self, bytes: u32) {
        self.shared
            .state
            .lock()
            .configure_recv_buffer_capacity(bytes);
    }

    /// Sets the datagram loss probability, clamped to [0, 1].
    pub fn configure_drop_probability(&self, probability: f64) {
        self.shared
            .state
            .lock()
            .configure_drop_probability(probability);
    }

    /// Rebuilds the latency distribution.
    pub fn configure_delay(&self, mean_ms: u32, stddev_ms: u32, samples: u32) {
        self.shared
            .state
            .lock()
            .configure_delay(mean_ms, stddev_ms, samples);
    }

    /// Makes wildcard bindings of `ip`'s family reachable through `ip`, and
    /// stamps traffic from wildcard-bound sockets with it.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InvalidValue` - `ip` is a wildcard address
    pub fn configure_default_route(&self, ip: IpAddr) -> Result<(), vnet_core::ConfigError> {
        if ip.is_unspecified() {
            return Err(vnet_core::ConfigError::InvalidValue {
                field: "default_route",
                reason: format!("{ip} is a wildcard address"),
            });
        }
        self.shared.state.lock().configure_default_route(ip);
        Ok(())
    }

    /// Moves the ephemeral port cursor.
    pub fn configure_next_port(&self, port: u16) {
        self.shared.state.lock().configure_next_port(port);
    }

    /// Hands out the next test IP of `family`: `1.0.0.0`, `1.0.0.1`, ... for
    /// IPv4 and `::2`, `::3`, ... for IPv6.
    pub fn next_ip(&self, family: IpFamily) -> IpAddr {
        self.shared.state.lock().next_ip(family)
    }

    /// Closes the stream socket at `local` connected to `remote` as if the
    /// peer had reset it. Returns false when no such connection exists.
    pub fn close_tcp_connection(&self, local: SocketAddr, remote: SocketAddr) -> bool {
        self.shared
            .with_state(|state| state.close_tcp_connection(local, remote))
    }

    /// Traffic counters so far.
    pub fn stats(&self) -> NetworkStats {
        self.shared.state.lock().stats()
    }

    /// Read-only view of every socket and table.
    pub fn snapshot(&self) -> NetworkSnapshot {
        self.shared.state.lock().snapshot()
    }

    /// Adds an invariant checked while processing.
    pub fn add_invariant(&self, invariant: Arc<dyn Invariant>) {
        self.shared.state.lock().add_invariant(invariant);
    }
}

impl fmt::Debug for VirtualNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("VirtualNetwork")
            .field("seed", &state.seed())
            .field("elapsed", &state.elapsed())
            .field("pending_events", &state.pending_events())
            .finish()
    }
}

/// Builder for configuring a [`VirtualNetwork`].
pub struct VirtualNetworkBuilder {
    config: NetworkConfig,
    scheduler: Option<Box<dyn Scheduler>>,
    invariants: Vec<Arc<dyn Invariant>>,
}

impl VirtualNetworkBuilder {
    /// Creates new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: NetworkConfig::default(),
            scheduler: None,
            invariants: Vec::new(),
        }
    }

    /// Replaces every parameter.
    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the random seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Sets the aggregate bandwidth in bytes per second.
    pub fn bandwidth(mut self, bytes_per_second: u32) -> Self {
        self.config.bandwidth = bytes_per_second;
        self
    }

    /// Sets the latency distribution.
    pub fn delay(mut self, mean_ms: u32, stddev_ms: u32) -> Self {
        self.config.delay_mean_ms = mean_ms;
        self.config.delay_stddev_ms = stddev_ms;
        self
    }

    /// Sets the datagram loss probability.
    pub fn drop_probability(mut self, probability: f64) -> Self {
        self.config.drop_probability = probability;
        self
    }

    /// Sets the per-socket in-flight budget.
    pub fn network_capacity(mut self, bytes: u32) -> Self {
        self.config.network_capacity = bytes;
        self
    }

    /// Drives the network with a custom scheduler.
    pub fn scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    /// Adds an invariant checked while processing.
    pub fn invariant(mut self, invariant: Arc<dyn Invariant>) -> Self {
        self.invariants.push(invariant);
        self
    }

    /// Builds the network.
    pub fn build(self) -> VirtualNetwork {
        if let Err(error) = self.config.validate() {
            warn!(%error, "Building network with questionable configuration");
        }
        info!(
            seed = self.config.seed,
            bandwidth = self.config.bandwidth,
            delay_mean_ms = self.config.delay_mean_ms,
            delay_stddev_ms = self.config.delay_stddev_ms,
            drop_probability = self.config.drop_probability,
            "Creating virtual network"
        );

        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Box::new(DeterministicScheduler::new()));
        let state = NetworkState::new(self.config, scheduler, self.invariants);
        VirtualNetwork {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                hub: Mutex::new(SubscriberHub::default()),
            }),
        }
    }
}

impl Default for VirtualNetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}
