//! Link model: bandwidth, in-flight capacity, loss and latency distribution.

use std::net::SocketAddr;
use std::time::Duration;

use vnet_core::{AddressExt, IpFamily, NetworkConfig};
use vnet_sim::{SocketKind, VirtualNetwork, VirtualSocket};

use crate::harness::{addr, drain, init_test_tracing};

/// Bound sender connected to a bound receiver.
fn datagram_pair(network: &VirtualNetwork, initial: SocketAddr) -> (VirtualSocket, VirtualSocket) {
    let family = initial.family();
    let sender = network.create_socket(family, SocketKind::Datagram);
    let receiver = network.create_socket(family, SocketKind::Datagram);
    sender.bind(initial).unwrap();
    receiver.bind(initial).unwrap();
    assert_eq!(sender.local_address().unwrap().family(), family);
    assert_eq!(receiver.local_address().unwrap().family(), family);
    sender.connect(receiver.local_address().unwrap()).unwrap();
    (sender, receiver)
}

fn bandwidth_limits_throughput(initial: SocketAddr) {
    init_test_tracing();
    const BANDWIDTH: usize = 64 * 1024;
    let network = VirtualNetwork::new(NetworkConfig::default());
    let (sender, receiver) = datagram_pair(&network, initial);
    network.configure_bandwidth(BANDWIDTH as u32);

    // Offer roughly 80 KB/s for five seconds
    let payload = [0x5au8; 1000];
    let mut received = 0;
    for _ in 0..(5000 / 12) {
        assert_eq!(sender.send(&payload), Ok(payload.len()));
        network.process_for(Duration::from_millis(12));
        received += drain(&receiver).len();
    }
    // Let the queue drain
    network.process_for(Duration::from_secs(5));
    received += drain(&receiver).len();

    assert!(received >= 5 * 3 * BANDWIDTH / 4, "only {received} bytes arrived");
    assert!(received <= 6 * BANDWIDTH, "{received} bytes arrived");
    assert!(network.stats().datagrams_over_capacity > 0);
}

#[test]
fn test_bandwidth_v4() {
    bandwidth_limits_throughput(addr("0.0.0.0:0"));
}

#[test]
fn test_bandwidth_v6() {
    bandwidth_limits_throughput(addr("[::]:0"));
}

fn delay_matches_distribution(initial: SocketAddr) {
    const MEAN: f64 = 2000.0;
    const STDDEV: f64 = 500.0;
    const PACKETS: usize = 1000;

    let network = VirtualNetwork::builder()
        .seed(20_240_601)
        .delay(MEAN as u32, STDDEV as u32)
        .build();
    let (sender, receiver) = datagram_pair(&network, initial);

    for _ in 0..PACKETS {
        assert_eq!(sender.send(b"ping"), Ok(4));
    }

    // Everything left at time zero, so arrival time is the transit delay
    let mut samples = Vec::with_capacity(PACKETS);
    let mut buf = [0u8; 8];
    while network.process_next_event() {
        while receiver.recv(&mut buf).is_ok() {
            samples.push(network.elapsed().as_millis() as f64);
        }
    }

    assert_eq!(samples.len(), PACKETS);
    let count = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / count;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (count - 1.0);
    let stddev = variance.sqrt();

    assert!((mean - MEAN).abs() <= 0.15 * MEAN, "sample mean {mean}");
    assert!((stddev - STDDEV).abs() <= 0.15 * STDDEV, "sample stddev {stddev}");
}

#[test]
fn test_delay_v4() {
    delay_matches_distribution(addr("0.0.0.0:0"));
}

#[test]
fn test_delay_v6() {
    delay_matches_distribution(addr("[::]:0"));
}

#[test]
fn test_capacity_drops_excess_datagrams() {
    let network = VirtualNetwork::builder()
        .bandwidth(1000)
        .network_capacity(4096)
        .build();
    let (sender, receiver) = datagram_pair(&network, addr("10.0.0.1:0"));

    // Three 1028-byte wire packets fit, the fourth would exceed 4096
    let payload = [1u8; 1000];
    for _ in 0..10 {
        assert_eq!(sender.send(&payload), Ok(1000));
    }
    let stats = network.stats();
    assert_eq!(stats.datagrams_sent, 3);
    assert_eq!(stats.datagrams_over_capacity, 7);

    network.process_messages_until_idle();
    assert_eq!(drain(&receiver).len(), 3000);

    // Serialization finished, so the budget is available again
    assert_eq!(sender.send(&payload), Ok(1000));
    assert_eq!(network.stats().datagrams_sent, 4);
}

#[test]
fn test_loss_drops_a_fraction_of_datagrams() {
    let network = VirtualNetwork::builder()
        .seed(99)
        .drop_probability(0.5)
        .build();
    let receiver = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    receiver.bind(addr("10.0.0.1:9000")).unwrap();
    let sender = network.create_socket(IpFamily::V4, SocketKind::Datagram);

    for i in 0..1000u32 {
        // Lost datagrams still report success to the sender
        assert_eq!(sender.send_to(&i.to_be_bytes(), addr("10.0.0.1:9000")), Ok(4));
    }
    network.process_messages_until_idle();

    let delivered = drain(&receiver).len() / 4;
    let stats = network.stats();
    assert_eq!(stats.datagrams_lost as usize + delivered, 1000);
    assert!((400..=600).contains(&delivered), "{delivered} delivered");
    assert!((stats.datagram_loss_ratio() - 0.5).abs() < 0.1);
}

#[test]
fn test_stream_traffic_is_never_dropped() {
    let network = VirtualNetwork::builder()
        .seed(5)
        .drop_probability(0.9)
        .delay(5, 2)
        .build();
    let listener = network.create_socket(IpFamily::V4, SocketKind::Stream);
    listener.bind(addr("10.0.0.1:80")).unwrap();
    listener.listen(5).unwrap();
    let client = network.create_socket(IpFamily::V4, SocketKind::Stream);
    client.connect(addr("10.0.0.1:80")).unwrap();
    network.process_messages_until_idle();
    let (server, _) = listener.accept().unwrap();
    network.process_messages_until_idle();

    let payload = vec![3u8; 6000];
    assert_eq!(client.send(&payload), Ok(6000));
    network.process_messages_until_idle();
    assert_eq!(drain(&server), payload);
}

#[test]
fn test_total_loss_still_reports_bytes_sent() {
    let network = VirtualNetwork::builder()
        .seed(3)
        .drop_probability(1.0)
        .build();
    let receiver = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    receiver.bind(addr("10.0.0.1:9000")).unwrap();
    let sender = network.create_socket(IpFamily::V4, SocketKind::Datagram);

    for _ in 0..100 {
        assert_eq!(sender.send_to(b"foo", addr("10.0.0.1:9000")), Ok(3));
    }
    network.process_messages_until_idle();

    assert!(drain(&receiver).is_empty());
    let stats = network.stats();
    assert_eq!(stats.datagrams_lost, 100);
    assert_eq!(stats.datagrams_sent, 0);
}

#[test]
fn test_unlimited_bandwidth_adds_no_queueing_delay() {
    let network = VirtualNetwork::builder().delay(100, 0).build();
    let (sender, receiver) = datagram_pair(&network, addr("10.0.0.1:0"));

    let payload = [7u8; 1000];
    for _ in 0..50 {
        assert_eq!(sender.send(&payload), Ok(1000));
    }
    // 50 KB offered at once is accepted whole
    assert_eq!(network.stats().datagrams_sent, 50);

    // Every packet lands exactly one transit delay after it was sent
    let mut arrivals = Vec::new();
    let mut buf = [0u8; 1000];
    while network.process_next_event() {
        while receiver.recv(&mut buf).is_ok() {
            arrivals.push(network.elapsed());
        }
    }
    assert_eq!(arrivals.len(), 50);
    assert!(arrivals.iter().all(|at| *at == Duration::from_millis(100)));
}
