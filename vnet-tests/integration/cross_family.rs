//! Dual-stack reachability between IPv4, IPv6 and IPv4-mapped endpoints.

use std::net::SocketAddr;

use vnet_core::{AddressExt, IpFamily, NetworkConfig, SocketError};
use vnet_sim::{ConnState, EventLog, SocketEventKind, SocketKind, SocketOption, VirtualNetwork};

use crate::harness::{addr, init_test_tracing, recv_packet};

fn stream_connection(client_addr: &str, server_addr: &str, should_succeed: bool) {
    init_test_tracing();
    let client_addr = addr(client_addr);
    let server_addr = addr(server_addr);
    let network = VirtualNetwork::new(NetworkConfig::default());
    let mut log = EventLog::new();

    let client = network.create_socket(client_addr.family(), SocketKind::Stream);
    log.monitor(&client);
    assert_eq!(client.state(), ConnState::Closed);
    assert_eq!(client.local_address(), None);
    client.bind(client_addr).unwrap();

    let server = network.create_socket(server_addr.family(), SocketKind::Stream);
    log.monitor(&server);
    server.bind(server_addr).unwrap();
    server.listen(5).unwrap();
    let listen_addr = server.local_address().unwrap();

    if should_succeed {
        client.connect(listen_addr).unwrap();
        network.process_messages_until_idle();
        assert!(log.check(&server, SocketEventKind::Readable));
        let (_accepted, accept_addr) = server.accept().unwrap();
        assert_eq!(Some(accept_addr), client.local_address());

        network.process_messages_until_idle();
        assert!(log.check(&client, SocketEventKind::Connected));
        assert_eq!(client.remote_address(), Some(listen_addr));
    } else {
        assert_eq!(client.connect(listen_addr), Err(SocketError::HostUnreachable));
        network.process_messages_until_idle();

        assert!(!log.check(&server, SocketEventKind::Readable));
        assert!(matches!(server.accept(), Err(SocketError::WouldBlock)));
        assert_eq!(client.state(), ConnState::Closed);
        assert!(!log.check(&client, SocketEventKind::Connected));
        assert_eq!(client.remote_address(), None);
    }
}

#[test]
fn test_can_connect_from_mapped_ipv6_to_ipv4_any() {
    stream_connection("[::ffff:127.0.0.2]:0", "0.0.0.0:5000", true);
}

#[test]
fn test_cant_connect_from_unmapped_ipv6_to_ipv4_any() {
    stream_connection("[::2]:0", "0.0.0.0:5000", false);
}

#[test]
fn test_cant_connect_from_unmapped_ipv6_to_mapped_ipv6() {
    stream_connection("[::2]:0", "[::ffff:127.0.0.1]:5000", false);
}

#[test]
fn test_can_connect_from_ipv4_to_ipv6_any() {
    stream_connection("127.0.0.2:0", "[::]:5000", true);
}

#[test]
fn test_cant_connect_from_ipv4_to_unmapped_ipv6() {
    stream_connection("127.0.0.2:0", "[::1]:5000", false);
}

#[test]
fn test_can_connect_from_ipv4_to_mapped_ipv6() {
    stream_connection("127.0.0.1:0", "[::ffff:127.0.0.2]:5000", true);
}

#[test]
fn test_can_connect_from_unbound_ipv6_to_ipv4_any() {
    stream_connection("[::]:0", "0.0.0.0:5000", true);
}

#[test]
fn test_can_connect_from_unbound_ipv4_to_ipv6_any() {
    stream_connection("0.0.0.0:0", "[::]:5000", true);
}

fn datagram_exchange(client_addr: &str, server_addr: &str, should_succeed: bool) {
    let client_addr = addr(client_addr);
    let server_addr = addr(server_addr);
    let network = VirtualNetwork::new(NetworkConfig::default());

    let server = network.create_socket(server_addr.family(), SocketKind::Datagram);
    server.bind(server_addr).unwrap();
    let bound_server_addr = server.local_address().unwrap();

    let client = network.create_socket(client_addr.family(), SocketKind::Datagram);
    client.bind(client_addr).unwrap();

    if should_succeed {
        assert_eq!(client.send_to(b"foo", bound_server_addr), Ok(3));
        network.process_messages_until_idle();
        let (data, seen_client_addr) = recv_packet(&server);
        assert_eq!(data, b"foo");

        assert_eq!(server.send_to(b"bizbaz", seen_client_addr), Ok(6));
        network.process_messages_until_idle();
        let (data, seen_server_addr) = recv_packet(&client);
        assert_eq!(data, b"bizbaz");
        assert_eq!(seen_server_addr, bound_server_addr);
    } else {
        assert_eq!(
            client.send_to(b"foo", bound_server_addr),
            Err(SocketError::HostUnreachable)
        );
        network.process_messages_until_idle();
        let mut buf = [0u8; 8];
        assert_eq!(server.recv(&mut buf), Err(SocketError::WouldBlock));
    }
}

#[test]
fn test_can_send_datagram_from_unbound_ipv4_to_ipv6_any() {
    datagram_exchange("0.0.0.0:0", "[::]:5000", true);
}

#[test]
fn test_can_send_datagram_from_mapped_ipv6_to_ipv4_any() {
    datagram_exchange("[::ffff:127.0.0.1]:0", "0.0.0.0:5000", true);
}

#[test]
fn test_cant_send_datagram_from_unmapped_ipv6_to_ipv4_any() {
    datagram_exchange("[::2]:0", "0.0.0.0:5000", false);
}

#[test]
fn test_cant_send_datagram_from_unmapped_ipv6_to_mapped_ipv6() {
    datagram_exchange("[::2]:0", "[::ffff:127.0.0.1]:5000", false);
}

#[test]
fn test_can_send_datagram_from_ipv4_to_ipv6_any() {
    datagram_exchange("127.0.0.2:0", "[::]:5000", true);
}

#[test]
fn test_cant_send_datagram_from_ipv4_to_unmapped_ipv6() {
    datagram_exchange("127.0.0.2:0", "[::1]:5000", false);
}

#[test]
fn test_can_send_datagram_from_ipv4_to_mapped_ipv6() {
    datagram_exchange("127.0.0.1:0", "[::ffff:127.0.0.2]:5000", true);
}

#[test]
fn test_can_send_datagram_from_unbound_ipv6_to_ipv4_any() {
    datagram_exchange("[::]:0", "0.0.0.0:5000", true);
}

#[test]
fn test_ipv6_wildcard_stays_dual_stack_with_v6_only_option() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let server = network.create_socket(IpFamily::V6, SocketKind::Datagram);
    server.configure_option(SocketOption::Ipv6Only, 1);
    server.bind(addr("[::]:5000")).unwrap();
    assert_eq!(server.option(SocketOption::Ipv6Only), Some(1));

    let client = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    client.bind(addr("127.0.0.2:0")).unwrap();

    // A socket bound to the IPv6 wildcard talks to anyone
    let target: SocketAddr = server.local_address().unwrap();
    assert_eq!(client.send_to(b"foo", target), Ok(3));
    network.process_messages_until_idle();
    let (_, from) = recv_packet(&server);
    assert_eq!(from, client.local_address().unwrap());
}
