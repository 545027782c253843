//! Tests for scheduler and network interplay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use vnet_core::{IpFamily, NetworkConfig, SocketError};

use crate::deterministic::{Invariant, InvariantViolation};
use crate::network::{NetworkSnapshot, VirtualNetwork};
use crate::notify::{EventLog, SocketEventKind};
use crate::socket::{ConnState, SocketKind};
use crate::standard_invariants;

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn lossy_exchange(seed: u64) -> (Vec<u8>, Duration) {
    let network = VirtualNetwork::builder()
        .seed(seed)
        .delay(40, 15)
        .drop_probability(0.3)
        .build();
    let receiver = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    receiver.bind(addr("10.0.0.1:9000")).unwrap();
    let sender = network.create_socket(IpFamily::V4, SocketKind::Datagram);

    for i in 0..50u8 {
        sender.send_to(&[i], addr("10.0.0.1:9000")).unwrap();
    }
    let report = network.process_messages_until_idle();

    let mut order = Vec::new();
    let mut buf = [0u8; 1];
    while receiver.recv(&mut buf).is_ok() {
        order.push(buf[0]);
    }
    (order, report.elapsed)
}

#[test]
fn test_same_seed_reproduces_run() {
    let (first_order, first_elapsed) = lossy_exchange(12345);
    let (second_order, second_elapsed) = lossy_exchange(12345);

    assert_eq!(first_order, second_order);
    assert_eq!(first_elapsed, second_elapsed);
    assert!(first_order.len() < 50, "some datagrams should be lost");
}

#[test]
fn test_different_seed_changes_run() {
    let (first_order, _) = lossy_exchange(1);
    let (second_order, _) = lossy_exchange(2);

    assert_ne!(first_order, second_order);
}

#[test]
fn test_delivery_waits_for_transit_delay() {
    let network = VirtualNetwork::builder().delay(100, 0).build();
    let receiver = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    receiver.bind(addr("10.0.0.1:9000")).unwrap();
    let sender = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    sender.send_to(b"hello", addr("10.0.0.1:9000")).unwrap();

    let report = network.process_for(Duration::from_millis(99));
    let mut buf = [0u8; 16];
    assert_eq!(receiver.recv(&mut buf), Err(SocketError::WouldBlock));
    assert_eq!(report.elapsed, Duration::from_millis(99));

    network.process_for(Duration::from_millis(1));
    assert_eq!(receiver.recv(&mut buf), Ok(5));
    assert_eq!(network.elapsed(), Duration::from_millis(100));
}

#[test]
fn test_process_for_advances_idle_clock() {
    let network = VirtualNetwork::new(NetworkConfig::default());

    let report = network.process_for(Duration::from_secs(3));

    assert_eq!(report.events_processed, 0);
    assert_eq!(network.elapsed(), Duration::from_secs(3));
}

#[test]
fn test_event_for_destroyed_socket_is_ignored() {
    let network = VirtualNetwork::builder().delay(10, 0).build();
    let receiver = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    receiver.bind(addr("10.0.0.1:9000")).unwrap();
    let sender = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    sender.send_to(b"late", addr("10.0.0.1:9000")).unwrap();

    drop(receiver);
    let report = network.process_messages_until_idle();

    assert!(report.is_clean());
    assert_eq!(network.stats().packets_delivered, 0);
    assert_eq!(network.pending_events(), 0);
}

#[test]
fn test_handler_may_call_back_into_sockets() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let server = Arc::new(network.create_socket(IpFamily::V4, SocketKind::Datagram));
    server.bind(addr("10.0.0.1:7")).unwrap();
    let client = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    client.bind(addr("10.0.0.2:7000")).unwrap();

    // Echo server: replies to every datagram from inside the notification.
    let echo = Arc::clone(&server);
    let _subscription = server.subscribe(move |event| {
        if event.kind() == SocketEventKind::Readable {
            let mut buf = [0u8; 64];
            if let Ok((read, from)) = echo.recv_from(&mut buf) {
                let _ = echo.send_to(&buf[..read], from);
            }
        }
    });

    client.send_to(b"echo me", addr("10.0.0.1:7")).unwrap();
    network.process_messages_until_idle();

    let mut buf = [0u8; 64];
    let (read, from) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..read], b"echo me");
    assert_eq!(from, addr("10.0.0.1:7"));
}

#[test]
fn test_dropped_subscription_stops_notifications() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let socket = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    let count = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&count);
    let subscription = socket.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    socket.bind(addr("10.0.0.1:1")).unwrap();
    network.process_messages_until_idle();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    drop(subscription);
    socket.send_to(b"x", addr("10.0.0.1:1")).unwrap();
    network.process_messages_until_idle();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_blocking_socket_pumps_scheduler() {
    let network = VirtualNetwork::builder().delay(25, 0).build();
    let receiver = network.create_blocking_socket(IpFamily::V4);
    receiver.bind(addr("10.0.0.1:9000")).unwrap();
    let sender = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    sender.send_to(b"wake", addr("10.0.0.1:9000")).unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(receiver.recv(&mut buf), Ok(4));
    assert_eq!(network.elapsed(), Duration::from_millis(25));

    // Nothing else is coming: returns instead of hanging
    assert_eq!(receiver.recv(&mut buf), Err(SocketError::WouldBlock));
}

#[test]
fn test_standard_invariants_hold_during_stream_transfer() {
    let mut builder = VirtualNetwork::builder()
        .delay(20, 10)
        .seed(3)
        .network_capacity(8 * 1024);
    for invariant in standard_invariants() {
        builder = builder.invariant(invariant);
    }
    let network = builder.build();

    let listener = network.create_socket(IpFamily::V4, SocketKind::Stream);
    listener.bind(addr("10.0.0.1:80")).unwrap();
    listener.listen(5).unwrap();
    let client = network.create_socket(IpFamily::V4, SocketKind::Stream);
    client.connect(addr("10.0.0.1:80")).unwrap();
    network.process_messages_until_idle();

    let (server, _) = listener.accept().unwrap();
    let report = network.process_messages_until_idle();
    assert!(report.is_clean(), "{:?}", report.violations);
    assert_eq!(client.state(), ConnState::Connected);

    let payload = vec![7u8; 20_000];
    let mut sent = 0;
    let mut received = 0;
    let mut buf = [0u8; 4096];
    while received < payload.len() {
        if sent < payload.len() {
            if let Ok(count) = client.send(&payload[sent..]) {
                sent += count;
            }
        }
        let report = network.process_for(Duration::from_millis(50));
        assert!(report.is_clean(), "{:?}", report.violations);
        while let Ok(read) = server.recv(&mut buf) {
            received += read;
        }
    }

    assert_eq!(received, payload.len());
    client.close().unwrap();
    let report = network.process_messages_until_idle();
    assert!(report.is_clean(), "{:?}", report.violations);
    assert_eq!(server.state(), ConnState::Closed);
}

struct NoSocketsInvariant;

impl Invariant for NoSocketsInvariant {
    fn check(&self, snapshot: &NetworkSnapshot) -> Result<(), InvariantViolation> {
        if snapshot.sockets.is_empty() {
            return Ok(());
        }
        Err(InvariantViolation {
            invariant: self.name().to_string(),
            description: format!("{} sockets exist", snapshot.sockets.len()),
            elapsed: snapshot.elapsed,
        })
    }

    fn name(&self) -> &str {
        "NoSockets"
    }
}

#[test]
fn test_violations_are_reported_per_event() {
    let network = VirtualNetwork::builder()
        .invariant(Arc::new(NoSocketsInvariant))
        .build();
    let socket = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    socket.bind(addr("10.0.0.1:1")).unwrap();

    let report = network.process_messages_until_idle();

    assert_eq!(report.events_processed, 1);
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].invariant, "NoSockets");
}

#[test]
fn test_event_log_records_address_ready() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let socket = network.create_socket(IpFamily::V6, SocketKind::Datagram);
    let mut log = EventLog::new();
    log.monitor(&socket);

    socket.bind(addr("[::1]:4000")).unwrap();
    assert!(!log.check(&socket, SocketEventKind::AddressReady));

    network.process_messages_until_idle();
    assert!(log.check(&socket, SocketEventKind::AddressReady));
    assert!(log.is_empty());
}
