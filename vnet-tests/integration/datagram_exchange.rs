//! Datagram sockets: exchange, implicit binds, default route and limits.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use proptest::prelude::*;
use vnet_core::{AddressExt, IpFamily, NetworkConfig, SocketError};
use vnet_sim::network::{FIRST_EPHEMERAL_PORT, LAST_EPHEMERAL_PORT, MAX_DATAGRAM_PAYLOAD};
use vnet_sim::{SocketKind, VirtualNetwork, VirtualSocket};

use crate::harness::{addr, init_test_tracing, recv_packet};

fn udp(network: &VirtualNetwork, family: IpFamily) -> VirtualSocket {
    network.create_socket(family, SocketKind::Datagram)
}

fn basic_exchange(initial: SocketAddr) {
    init_test_tracing();
    let family = initial.family();
    let network = VirtualNetwork::new(NetworkConfig::default());

    let server = udp(&network, family);
    server.bind(initial).unwrap();
    let server_addr = server.local_address().unwrap();
    assert_eq!(server_addr.family(), family);

    // Unbound sender picks up an ephemeral port on first send
    let client = udp(&network, family);
    assert_eq!(client.send_to(b"foo", server_addr), Ok(3));
    network.process_messages_until_idle();
    let (data, mut client_addr) = recv_packet(&server);
    assert_eq!(data, b"foo");

    assert_eq!(server.send_to(b"bizbaz", client_addr), Ok(6));
    network.process_messages_until_idle();
    let (data, from) = recv_packet(&client);
    assert_eq!(data, b"bizbaz");
    assert_eq!(from, server_addr);

    let empty = family.any_address();
    for _ in 0..10 {
        let next_client = udp(&network, family);
        next_client.bind(empty).unwrap();

        assert_eq!(next_client.send_to(b"foo", server_addr), Ok(3));
        network.process_messages_until_idle();
        let (_, next_client_addr) = recv_packet(&server);
        assert_eq!(next_client_addr.port(), client_addr.port() + 1);
        assert_eq!(next_client_addr.ip(), client_addr.ip());

        assert_eq!(server.send_to(b"bizbaz", next_client_addr), Ok(6));
        network.process_messages_until_idle();
        let (_, from) = recv_packet(&next_client);
        assert_eq!(from, server_addr);

        client_addr = next_client_addr;
    }
}

#[test]
fn test_basic_exchange_v4() {
    basic_exchange(addr("0.0.0.0:5000"));
}

#[test]
fn test_basic_exchange_v6() {
    basic_exchange(addr("[::]:5000"));
}

fn default_route_exchange(route: IpAddr) {
    init_test_tracing();
    let family = route.family();
    let network = VirtualNetwork::new(NetworkConfig::default());
    network.configure_default_route(route).unwrap();

    let wildcard_client = udp(&network, family);
    wildcard_client.bind(family.any_address()).unwrap();
    let wildcard_addr = wildcard_client.local_address().unwrap();
    assert!(wildcard_addr.is_any_ip());

    let routed_client = udp(&network, family);
    routed_client.bind(SocketAddr::new(route, 0)).unwrap();
    let routed_addr = routed_client.local_address().unwrap();
    assert!(!routed_addr.is_any_ip());

    // Traffic from the wildcard socket appears to come from the route
    assert_eq!(wildcard_client.send_to(b"bizbaz", routed_addr), Ok(6));
    network.process_messages_until_idle();
    let (data, from) = recv_packet(&routed_client);
    assert_eq!(data, b"bizbaz");
    assert_eq!(from, SocketAddr::new(route, wildcard_addr.port()));

    // ...and the route address reaches the wildcard socket
    assert_eq!(routed_client.send_to(b"foo", from), Ok(3));
    network.process_messages_until_idle();
    let (data, from) = recv_packet(&wildcard_client);
    assert_eq!(data, b"foo");
    assert_eq!(from, routed_addr);
}

#[test]
fn test_default_route_v4() {
    default_route_exchange("1.2.3.4".parse().unwrap());
}

#[test]
fn test_default_route_v6() {
    default_route_exchange("2401:fa00:4:1000:be30:5bff:fee5:c3".parse().unwrap());
}

#[test]
fn test_wildcard_default_route_is_rejected() {
    let network = VirtualNetwork::new(NetworkConfig::default());

    assert!(network.configure_default_route("0.0.0.0".parse().unwrap()).is_err());
    assert!(network.configure_default_route("::".parse().unwrap()).is_err());
    assert_eq!(network.config().default_route_v4, None);
}

#[test]
fn test_oversized_datagram_is_rejected() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let receiver = udp(&network, IpFamily::V4);
    receiver.bind(addr("10.0.0.1:9000")).unwrap();
    let sender = udp(&network, IpFamily::V4);

    let largest = vec![1u8; MAX_DATAGRAM_PAYLOAD];
    assert_eq!(sender.send_to(&largest, addr("10.0.0.1:9000")), Ok(MAX_DATAGRAM_PAYLOAD));

    let oversized = vec![1u8; MAX_DATAGRAM_PAYLOAD + 1];
    assert_eq!(
        sender.send_to(&oversized, addr("10.0.0.1:9000")),
        Err(SocketError::FrameTooLarge)
    );
    assert_eq!(sender.error(), Some(SocketError::FrameTooLarge));

    network.process_messages_until_idle();
    let (data, _) = recv_packet(&receiver);
    assert_eq!(data.len(), MAX_DATAGRAM_PAYLOAD);
}

#[test]
fn test_datagram_to_nobody_is_silently_discarded() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let sender = udp(&network, IpFamily::V4);
    sender.bind(addr("127.0.0.1:4000")).unwrap();

    assert_eq!(sender.send_to(b"void", addr("10.9.9.9:1")), Ok(4));
    network.process_messages_until_idle();

    let stats = network.stats();
    assert_eq!(stats.datagrams_unroutable, 1);
    assert_eq!(stats.packets_delivered, 0);
}

#[test]
fn test_datagram_to_incompatible_family_fails_even_without_listener() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let sender = udp(&network, IpFamily::V4);
    sender.bind(addr("127.0.0.1:4000")).unwrap();

    assert_eq!(
        sender.send_to(b"void", addr("[::5]:1")),
        Err(SocketError::HostUnreachable)
    );
}

#[test]
fn test_connected_datagram_socket_sends_to_peer() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let receiver = udp(&network, IpFamily::V4);
    receiver.bind(addr("10.0.0.1:9000")).unwrap();
    let sender = udp(&network, IpFamily::V4);

    assert_eq!(sender.send(b"early"), Err(SocketError::NotConnected));
    sender.connect(addr("10.0.0.1:9000")).unwrap();
    assert!(sender.local_address().is_some());
    assert_eq!(sender.remote_address(), Some(addr("10.0.0.1:9000")));

    assert_eq!(sender.send(b"hello"), Ok(5));
    network.process_messages_until_idle();
    let (data, from) = recv_packet(&receiver);
    assert_eq!(data, b"hello");
    assert_eq!(from, sender.local_address().unwrap());
}

#[test]
fn test_bind_errors() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let first = udp(&network, IpFamily::V4);
    first.bind(addr("10.0.0.1:7000")).unwrap();

    let second = udp(&network, IpFamily::V4);
    assert_eq!(second.bind(addr("10.0.0.1:7000")), Err(SocketError::AddressInUse));
    assert_eq!(second.error(), Some(SocketError::AddressInUse));
    assert_eq!(first.bind(addr("10.0.0.1:7001")), Err(SocketError::AlreadyBound));

    // Releasing the address makes it available again
    drop(first);
    assert_eq!(second.bind(addr("10.0.0.1:7000")), Ok(()));
}

#[test]
fn test_mapped_address_binds_as_ipv4() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let socket = udp(&network, IpFamily::V6);

    socket.bind(addr("[::ffff:127.0.0.1]:4000")).unwrap();

    assert_eq!(socket.local_address(), Some(addr("127.0.0.1:4000")));
    let other = udp(&network, IpFamily::V4);
    assert_eq!(other.bind(addr("127.0.0.1:4000")), Err(SocketError::AddressInUse));
}

#[test]
fn test_generated_address_uses_next_test_ip() {
    let network = VirtualNetwork::new(NetworkConfig::default());
    let v4 = udp(&network, IpFamily::V4);
    let v6 = udp(&network, IpFamily::V6);

    let v4_addr = v4.bind_generated(0).unwrap();
    let v6_addr = v6.bind_generated(8000).unwrap();

    assert_eq!(v4_addr.ip(), "1.0.0.0".parse::<IpAddr>().unwrap());
    assert_eq!(v4_addr.port(), FIRST_EPHEMERAL_PORT);
    assert_eq!(v6_addr, addr("[::2]:8000"));
    assert_eq!(network.next_ip(IpFamily::V4), "1.0.0.1".parse::<IpAddr>().unwrap());
}

proptest! {
    #[test]
    fn test_ephemeral_ports_are_unique_and_in_range(
        start in FIRST_EPHEMERAL_PORT..=LAST_EPHEMERAL_PORT,
        count in 1usize..48,
        ipv6 in any::<bool>(),
    ) {
        let family = if ipv6 { IpFamily::V6 } else { IpFamily::V4 };
        let network = VirtualNetwork::new(NetworkConfig::default());
        network.configure_next_port(start);

        // An explicit bind on the next port must be skipped
        let fixed = udp(&network, family);
        fixed.bind(SocketAddr::new(family.any_ip(), start)).unwrap();

        let mut sockets = Vec::new();
        let mut ports = HashSet::new();
        for _ in 0..count {
            let socket = udp(&network, family);
            socket.bind(family.any_address()).unwrap();
            let port = socket.local_address().unwrap().port();
            prop_assert!((FIRST_EPHEMERAL_PORT..=LAST_EPHEMERAL_PORT).contains(&port));
            prop_assert_ne!(port, start);
            prop_assert!(ports.insert(port), "port {} handed out twice", port);
            sockets.push(socket);
        }
        prop_assert_eq!(ports.len(), count);
    }
}
