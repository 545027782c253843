//! Stream sockets: listen, connect, accept, close and refusal paths.

use std::net::SocketAddr;

use vnet_core::{AddressExt, IpFamily, NetworkConfig, SocketError};
use vnet_sim::network::ESTIMATED_MTU;
use vnet_sim::{ConnState, EventLog, SocketKind, SocketEventKind, VirtualNetwork, VirtualSocket};

use crate::harness::{addr, any, drain, init_test_tracing};

fn tcp(network: &VirtualNetwork, family: IpFamily) -> VirtualSocket {
    network.create_socket(family, SocketKind::Stream)
}

/// Listener, connected client and the accepted server end.
struct Established {
    listener: VirtualSocket,
    client: VirtualSocket,
    server: VirtualSocket,
}

fn establish(network: &VirtualNetwork, family: IpFamily) -> Established {
    let listener = tcp(network, family);
    listener.bind(any(family)).unwrap();
    listener.listen(5).unwrap();
    let client = tcp(network, family);
    client.connect(listener.local_address().unwrap()).unwrap();
    network.process_messages_until_idle();
    let (server, _) = listener.accept().unwrap();
    network.process_messages_until_idle();
    assert_eq!(client.state(), ConnState::Connected);
    Established {
        listener,
        client,
        server,
    }
}

fn connect_and_accept(initial: SocketAddr) {
    init_test_tracing();
    let family = initial.family();
    let network = VirtualNetwork::new(NetworkConfig::default());
    let mut log = EventLog::new();

    let client = tcp(&network, family);
    log.monitor(&client);
    assert_eq!(client.state(), ConnState::Closed);
    assert_eq!(client.local_address(), None);

    let server = tcp(&network, family);
    log.monitor(&server);
    assert_eq!(server.listen(5), Err(SocketError::InvalidState));
    server.bind(initial).unwrap();
    assert_eq!(server.local_address().unwrap().family(), family);
    server.listen(5).unwrap();
    assert_eq!(server.state(), ConnState::Connecting);
    assert!(server.is_listening());

    // No pending connections yet
    assert!(!log.check(&server, SocketEventKind::Readable));
    assert!(matches!(server.accept(), Err(SocketError::WouldBlock)));

    client.connect(server.local_address().unwrap()).unwrap();
    let client_addr = client.local_address().expect("connect binds implicitly");
    assert_eq!(client_addr.family(), family);
    assert_ne!(Some(client_addr), server.local_address());
    assert_eq!(client.state(), ConnState::Connecting);

    network.process_messages_until_idle();
    // Still waiting for the server to accept
    assert_eq!(client.state(), ConnState::Connecting);
    assert!(!log.check(&client, SocketEventKind::Connected));
    assert!(!log.check(&client, SocketEventKind::Closed));
    assert!(log.check(&server, SocketEventKind::Readable));

    let (accepted, accept_addr) = server.accept().unwrap();
    assert_eq!(accepted.remote_address(), Some(accept_addr));
    assert_eq!(accepted.state(), ConnState::Connected);
    assert_eq!(accepted.local_address(), server.local_address());
    assert_eq!(accept_addr, client_addr);

    network.process_messages_until_idle();
    assert_eq!(client.state(), ConnState::Connected);
    assert!(log.check(&client, SocketEventKind::Connected));
    assert!(!log.check(&client, SocketEventKind::Closed));
    assert_eq!(client.remote_address(), server.local_address());
    assert_eq!(client.remote_address(), accepted.local_address());
}

#[test]
fn test_connect_v4() {
    connect_and_accept(addr("0.0.0.0:0"));
}

#[test]
fn test_connect_v6() {
    connect_and_accept(addr("[::]:0"));
}

fn connect_to_non_listener(initial: SocketAddr) {
    let family = initial.family();
    let network = VirtualNetwork::new(NetworkConfig::default());
    let mut log = EventLog::new();

    let client = tcp(&network, family);
    log.monitor(&client);
    let server = tcp(&network, family);
    log.monitor(&server);
    server.bind(initial).unwrap();

    client.connect(server.local_address().unwrap()).unwrap();
    network.process_messages_until_idle();

    assert!(!log.check(&server, SocketEventKind::Readable));
    assert!(server.accept().is_err());

    assert_eq!(client.state(), ConnState::Closed);
    assert!(!log.check(&client, SocketEventKind::Connected));
    assert_eq!(log.close_error(&client), Some(Some(SocketError::ConnectionRefused)));
    assert_eq!(client.remote_address(), None);
    assert_eq!(network.stats().connections_refused, 1);
}

#[test]
fn test_connect_to_non_listener_v4() {
    connect_to_non_listener(addr("0.0.0.0:0"));
}

#[test]
fn test_connect_to_non_listener_v6() {
    connect_to_non_listener(addr("[::]:0"));
}

#[test]
fn test_connect_to_unbound_address_is_refused() {
    let network = VirtualNetwork::builder().delay(30, 0).build();
    let mut log = EventLog::new();
    let client = tcp(&network, IpFamily::V4);
    log.monitor(&client);

    client.connect(addr("10.0.0.9:80")).unwrap();
    assert_eq!(client.state(), ConnState::Connecting);
    // Refusal arrives after one transit delay, not synchronously
    assert_eq!(client.error(), None);

    network.process_messages_until_idle();
    assert_eq!(client.state(), ConnState::Closed);
    assert_eq!(log.close_error(&client), Some(Some(SocketError::ConnectionRefused)));
    assert_eq!(network.elapsed().as_millis(), 30);
}

fn close_during_connect(initial: SocketAddr) {
    let family = initial.family();
    let network = VirtualNetwork::new(NetworkConfig::default());
    let mut log = EventLog::new();

    let client = tcp(&network, family);
    log.monitor(&client);

    // Server closes before the request reaches its queue
    let server = tcp(&network, family);
    log.monitor(&server);
    server.bind(initial).unwrap();
    server.listen(5).unwrap();
    client.connect(server.local_address().unwrap()).unwrap();
    assert!(!log.check(&server, SocketEventKind::Readable));
    server.close().unwrap();
    network.process_messages_until_idle();

    assert_eq!(client.state(), ConnState::Closed);
    assert_eq!(log.close_error(&client), Some(Some(SocketError::ConnectionRefused)));
    assert!(log.check(&client, SocketEventKind::Closed));

    // Server closes while the request sits in its queue
    let server = tcp(&network, family);
    log.monitor(&server);
    server.bind(initial).unwrap();
    server.listen(5).unwrap();
    client.connect(server.local_address().unwrap()).unwrap();
    network.process_messages_until_idle();
    assert!(log.check(&server, SocketEventKind::Readable));
    server.close().unwrap();
    network.process_messages_until_idle();

    assert_eq!(client.state(), ConnState::Closed);
    assert_eq!(log.close_error(&client), Some(Some(SocketError::ConnectionRefused)));
    assert!(log.check(&client, SocketEventKind::Closed));

    // Client closes after the accept but before learning about it
    let server = tcp(&network, family);
    log.monitor(&server);
    server.bind(initial).unwrap();
    server.listen(5).unwrap();
    client.connect(server.local_address().unwrap()).unwrap();
    network.process_messages_until_idle();
    assert!(log.check(&server, SocketEventKind::Readable));
    let (accepted, _) = server.accept().unwrap();
    log.monitor(&accepted);
    assert_eq!(accepted.state(), ConnState::Connected);
    assert_eq!(client.state(), ConnState::Connecting);

    client.close().unwrap();
    network.process_messages_until_idle();

    assert_eq!(accepted.state(), ConnState::Closed);
    assert_eq!(log.close_error(&accepted), Some(None));
    assert!(log.check(&accepted, SocketEventKind::Closed));
    assert!(!log.check(&client, SocketEventKind::Closed));
}

#[test]
fn test_close_during_connect_v4() {
    close_during_connect(addr("0.0.0.0:0"));
}

#[test]
fn test_close_during_connect_v6() {
    close_during_connect(addr("[::]:0"));
}

fn close_after_simultaneous_open(initial: SocketAddr) {
    let family = initial.family();
    let network = VirtualNetwork::new(NetworkConfig::default());
    let mut log = EventLog::new();

    let a = tcp(&network, family);
    log.monitor(&a);
    a.bind(initial).unwrap();
    let b = tcp(&network, family);
    log.monitor(&b);
    b.bind(initial).unwrap();

    a.connect(b.local_address().unwrap()).unwrap();
    b.connect(a.local_address().unwrap()).unwrap();
    network.process_messages_until_idle();

    assert!(log.check(&a, SocketEventKind::Connected));
    assert_eq!(a.state(), ConnState::Connected);
    assert_eq!(a.remote_address(), b.local_address());
    assert!(log.check(&b, SocketEventKind::Connected));
    assert_eq!(b.state(), ConnState::Connected);
    assert_eq!(b.remote_address(), a.local_address());

    assert_eq!(a.send(b"a"), Ok(1));
    b.close().unwrap();
    // The peer has not heard about the close yet
    assert_eq!(a.send(b"b"), Ok(1));
    network.process_messages_until_idle();

    let mut buf = [0u8; 10];
    assert!(!log.check(&b, SocketEventKind::Readable));
    assert!(b.recv(&mut buf).is_err());

    assert!(log.check(&a, SocketEventKind::Closed));
    assert_eq!(a.state(), ConnState::Closed);
    assert_eq!(a.remote_address(), None);

    // No notification for the side that closed
    assert!(!log.check(&b, SocketEventKind::Closed));
    assert_eq!(b.state(), ConnState::Closed);
    assert_eq!(b.remote_address(), None);
}

#[test]
fn test_close_v4() {
    close_after_simultaneous_open(addr("0.0.0.0:0"));
}

#[test]
fn test_close_v6() {
    close_after_simultaneous_open(addr("[::]:0"));
}

#[test]
fn test_data_flows_both_ways_over_accepted_connection() {
    let network = VirtualNetwork::builder().delay(10, 0).build();
    let Established { client, server, .. } = establish(&network, IpFamily::V4);

    assert_eq!(client.send(b"request"), Ok(7));
    network.process_messages_until_idle();
    assert_eq!(drain(&server), b"request");

    assert_eq!(server.send(b"response"), Ok(8));
    network.process_messages_until_idle();
    assert_eq!(drain(&client), b"response");
    assert!(network.stats().segments_sent >= 2);
}

#[test]
fn test_backlog_refuses_excess_connections() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let mut log = EventLog::new();
    let listener = tcp(&network, IpFamily::V4);
    listener.bind(addr("10.0.0.1:80")).unwrap();
    listener.listen(1).unwrap();

    let first = tcp(&network, IpFamily::V4);
    log.monitor(&first);
    let second = tcp(&network, IpFamily::V4);
    log.monitor(&second);
    first.connect(addr("10.0.0.1:80")).unwrap();
    second.connect(addr("10.0.0.1:80")).unwrap();
    network.process_messages_until_idle();

    assert_eq!(first.state(), ConnState::Connecting);
    assert_eq!(second.state(), ConnState::Closed);
    assert_eq!(log.close_error(&second), Some(Some(SocketError::ConnectionRefused)));

    let (_accepted, peer) = listener.accept().unwrap();
    assert_eq!(Some(peer), first.local_address());
    assert!(matches!(listener.accept(), Err(SocketError::WouldBlock)));
}

#[test]
fn test_close_tcp_connection_resets_both_ends() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let Established { client, server, .. } = establish(&network, IpFamily::V4);
    let mut log = EventLog::new();
    log.monitor(&client);
    log.monitor(&server);

    let local = client.local_address().unwrap();
    let remote = client.remote_address().unwrap();
    assert!(!network.close_tcp_connection(remote, addr("10.9.9.9:1")));
    assert!(network.close_tcp_connection(local, remote));

    assert_eq!(client.state(), ConnState::Closed);
    assert_eq!(log.close_error(&client), Some(None));

    network.process_messages_until_idle();
    assert_eq!(server.state(), ConnState::Closed);
    assert_eq!(log.close_error(&server), Some(None));
    assert!(!network.close_tcp_connection(local, remote));
}

#[test]
fn test_estimate_mtu_requires_connection() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let idle = tcp(&network, IpFamily::V4);
    assert_eq!(idle.estimate_mtu(), Err(SocketError::NotConnected));

    let Established { client, server, .. } = establish(&network, IpFamily::V4);
    assert_eq!(client.estimate_mtu(), Ok(ESTIMATED_MTU));
    assert_eq!(server.estimate_mtu(), Ok(65536));
}

#[test]
fn test_invalid_state_transitions() {
    let network = VirtualNetwork::new(NetworkConfig::default());

    let datagram = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    datagram.bind(addr("10.0.0.1:53")).unwrap();
    assert_eq!(datagram.listen(5), Err(SocketError::InvalidState));

    let listener = tcp(&network, IpFamily::V4);
    listener.bind(addr("10.0.0.1:80")).unwrap();
    assert!(matches!(tcp(&network, IpFamily::V4).accept(), Err(SocketError::InvalidState)));
    listener.listen(5).unwrap();
    assert_eq!(listener.listen(5), Err(SocketError::InvalidState));
    assert_eq!(listener.connect(addr("10.0.0.2:80")), Err(SocketError::InvalidState));

    let client = tcp(&network, IpFamily::V4);
    let mut buf = [0u8; 4];
    assert_eq!(client.send(b"x"), Err(SocketError::NotConnected));
    assert_eq!(client.recv(&mut buf), Err(SocketError::WouldBlock));
    client.connect(addr("10.0.0.1:80")).unwrap();
    assert_eq!(client.connect(addr("10.0.0.1:80")), Err(SocketError::ConnectInProgress));
    assert_eq!(client.error(), Some(SocketError::ConnectInProgress));

    network.process_messages_until_idle();
    let (_server, _) = listener.accept().unwrap();
    network.process_messages_until_idle();
    assert_eq!(client.connect(addr("10.0.0.1:80")), Err(SocketError::AlreadyConnected));
}

#[test]
fn test_alternative_local_address_is_reported() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let socket = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    socket.bind(addr("10.0.0.1:5000")).unwrap();

    socket.configure_alternative_local_address(addr("192.0.2.1:5000"));

    assert_eq!(socket.local_address(), Some(addr("192.0.2.1:5000")));
    // The binding itself does not move
    let other = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    assert_eq!(other.bind(addr("10.0.0.1:5000")), Err(SocketError::AddressInUse));
}

#[test]
fn test_dropping_listener_refuses_queued_peers() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let mut log = EventLog::new();
    let listener = tcp(&network, IpFamily::V6);
    listener.bind(addr("[::1]:443")).unwrap();
    listener.listen(0).unwrap();

    let client = tcp(&network, IpFamily::V6);
    log.monitor(&client);
    client.connect(addr("[::1]:443")).unwrap();
    network.process_messages_until_idle();

    drop(listener);
    network.process_messages_until_idle();
    assert_eq!(client.state(), ConnState::Closed);
    assert_eq!(log.close_error(&client), Some(Some(SocketError::ConnectionRefused)));
}

#[test]
fn test_closing_listener_keeps_accepted_connections() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let Established {
        listener,
        client,
        server,
    } = establish(&network, IpFamily::V4);

    listener.close().unwrap();
    network.process_messages_until_idle();

    assert_eq!(client.send(b"still here"), Ok(10));
    network.process_messages_until_idle();
    assert_eq!(drain(&server), b"still here");
}
