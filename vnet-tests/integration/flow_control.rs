//! Stream flow control: send buffers, receive windows, in-flight capacity
//! and ordering under jitter.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use vnet_core::config::{DEFAULT_DELAY_SAMPLES, MIN_NETWORK_CAPACITY};
use vnet_core::{AddressExt, IpFamily, NetworkConfig, SocketError};
use vnet_sim::{
    ConnState, EventLog, SocketEventKind, SocketKind, VirtualNetwork, VirtualSocket,
    standard_invariants,
};

use crate::harness::{addr, drain, init_test_tracing};

/// Two stream sockets bound to `initial` that connect to each other.
fn simultaneous_open(network: &VirtualNetwork, initial: SocketAddr) -> (VirtualSocket, VirtualSocket) {
    let family = initial.family();
    let a = network.create_socket(family, SocketKind::Stream);
    a.bind(initial).unwrap();
    let b = network.create_socket(family, SocketKind::Stream);
    b.bind(initial).unwrap();

    a.connect(b.local_address().unwrap()).unwrap();
    b.connect(a.local_address().unwrap()).unwrap();
    network.process_messages_until_idle();
    assert_eq!(a.state(), ConnState::Connected);
    assert_eq!(b.state(), ConnState::Connected);
    (a, b)
}

fn pattern(len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(len);
    for i in 0..len {
        buf.put_u8((i % 256) as u8);
    }
    buf.freeze()
}

fn tcp_send(initial: SocketAddr) {
    init_test_tracing();
    const BUFFER_SIZE: usize = 2000;
    const DATA_SIZE: usize = 5000;

    let network = VirtualNetwork::new(NetworkConfig::default());
    let (a, b) = simultaneous_open(&network, initial);
    let mut log = EventLog::new();
    log.monitor(&a);
    log.monitor(&b);

    network.configure_send_buffer_capacity(BUFFER_SIZE as u32);
    network.configure_recv_buffer_capacity(BUFFER_SIZE as u32);

    let payload = pattern(DATA_SIZE);
    let mut received = Vec::with_capacity(DATA_SIZE);
    let mut send_pos = 0;

    // Can't send more than the send buffer in one write
    assert_eq!(a.send(&payload[send_pos..]), Ok(BUFFER_SIZE));
    send_pos += BUFFER_SIZE;
    network.process_messages_until_idle();
    assert!(!log.check(&a, SocketEventKind::Writable));
    assert!(log.check(&b, SocketEventKind::Readable));

    // Receive window is full, so this only fills the send buffer again
    assert_eq!(a.send(&payload[send_pos..]), Ok(BUFFER_SIZE));
    send_pos += BUFFER_SIZE;
    network.process_messages_until_idle();
    assert!(!log.check(&a, SocketEventKind::Writable));
    assert!(!log.check(&b, SocketEventKind::Readable));

    // No room anywhere
    assert_eq!(a.send(&payload[send_pos..]), Err(SocketError::WouldBlock));
    assert_eq!(a.error(), Some(SocketError::WouldBlock));

    // Reading part of the data reopens the window
    let mut buf = [0u8; 500];
    assert_eq!(b.recv(&mut buf), Ok(500));
    received.extend_from_slice(&buf);
    network.process_messages_until_idle();
    assert!(log.check(&a, SocketEventKind::Writable));
    assert!(log.check(&b, SocketEventKind::Readable));

    assert_eq!(a.send(&payload[send_pos..]), Ok(500));
    send_pos += 500;

    received.extend(drain(&b));
    assert_eq!(b.error(), Some(SocketError::WouldBlock));
    network.process_messages_until_idle();
    assert!(log.check(&b, SocketEventKind::Readable));

    received.extend(drain(&b));

    // Send the last of the data
    assert_eq!(a.send(&payload[send_pos..]), Ok(500));
    send_pos += 500;
    network.process_messages_until_idle();
    assert!(log.check(&b, SocketEventKind::Readable));

    received.extend(drain(&b));
    network.process_messages_until_idle();
    assert!(!log.check(&b, SocketEventKind::Readable));

    assert_eq!(send_pos, DATA_SIZE);
    assert_eq!(received.len(), DATA_SIZE);
    assert_eq!(&received[..], &payload[..]);
}

#[test]
fn test_tcp_send_v4() {
    tcp_send(addr("0.0.0.0:0"));
}

#[test]
fn test_tcp_send_v6() {
    tcp_send(addr("[::]:0"));
}

fn sends_in_order(initial: SocketAddr) {
    const PACKETS: u8 = 10;
    let network = VirtualNetwork::builder().seed(17).build();
    let (a, b) = simultaneous_open(&network, initial);

    // Zero latency first
    for i in 0..PACKETS {
        assert_eq!(a.send(&[b'0' + i]), Ok(1));
    }
    network.process_messages_until_idle();
    let mut buf = [0u8; 2];
    for i in 0..PACKETS {
        assert_eq!(b.recv(&mut buf), Ok(1));
        assert_eq!(buf[0], b'0' + i);
    }

    // Then with jitter as large as the mean
    network.configure_delay(50, 50, DEFAULT_DELAY_SAMPLES);
    for i in 0..PACKETS {
        assert_eq!(a.send(&[b'A' + i]), Ok(1));
    }
    network.process_messages_until_idle();
    for i in 0..PACKETS {
        assert_eq!(b.recv(&mut buf), Ok(1));
        assert_eq!(buf[0], b'A' + i);
    }
}

#[test]
fn test_tcp_sends_packets_in_order_v4() {
    sends_in_order(addr("0.0.0.0:0"));
}

#[test]
fn test_tcp_sends_packets_in_order_v6() {
    sends_in_order(addr("[::]:0"));
}

#[test]
fn test_large_writes_are_segmented() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let (a, b) = simultaneous_open(&network, addr("127.0.0.1:0"));

    let payload = pattern(10_000);
    assert_eq!(a.send(&payload), Ok(10_000));
    network.process_messages_until_idle();

    // Segments carry at most 1360 payload bytes
    let mut buf = vec![0u8; 4096];
    assert_eq!(b.recv(&mut buf), Ok(1360));
    let mut received = buf[..1360].to_vec();
    received.extend(drain(&b));
    assert_eq!(&received[..], &payload[..]);
    assert_eq!(network.stats().segments_sent, 8);
}

#[test]
fn test_drain_resumes_when_in_flight_capacity_frees() {
    init_test_tracing();
    let mut builder = VirtualNetwork::builder()
        .bandwidth(10_000)
        .network_capacity(3000);
    for invariant in standard_invariants() {
        builder = builder.invariant(invariant);
    }
    let network = builder.build();
    let (a, b) = simultaneous_open(&network, addr("10.0.0.1:0"));

    let payload = pattern(8000);
    assert_eq!(a.send(&payload), Ok(8000));
    // In-flight capacity holds most of it back
    assert!(network.snapshot().socket(a.id()).unwrap().send_buffered > 0);

    let mut received = Vec::new();
    for _ in 0..20 {
        let report = network.process_for(Duration::from_millis(500));
        assert!(report.is_clean(), "{:?}", report.violations);
        received.extend(drain(&b));
        if received.len() == payload.len() {
            break;
        }
    }
    assert_eq!(&received[..], &payload[..]);
    assert_eq!(network.snapshot().socket(a.id()).unwrap().send_buffered, 0);
}

#[test]
fn test_tiny_capacity_still_drains_stream() {
    init_test_tracing();
    // Too small for a header plus payload; the network raises it
    let network = VirtualNetwork::builder().network_capacity(40).build();
    assert_eq!(network.config().network_capacity, MIN_NETWORK_CAPACITY);

    let listener = network.create_socket(IpFamily::V4, SocketKind::Stream);
    listener.bind(addr("10.0.0.1:80")).unwrap();
    listener.listen(1).unwrap();
    let client = network.create_socket(IpFamily::V4, SocketKind::Stream);
    client.connect(addr("10.0.0.1:80")).unwrap();
    network.process_messages_until_idle();
    let (server, _) = listener.accept().unwrap();
    network.process_messages_until_idle();

    assert_eq!(client.send(b"hello"), Ok(5));
    network.process_messages_until_idle();

    assert_eq!(drain(&server), b"hello");
    assert_eq!(network.snapshot().socket(client.id()).unwrap().send_buffered, 0);
    assert_eq!(network.pending_events(), 0);
}
