use std::hint::black_box;
use std::net::SocketAddr;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use vnet_core::{IpFamily, NetworkConfig};
use vnet_core::config::DEFAULT_DELAY_SAMPLES;
use vnet_sim::{DelayModel, DeterministicRng, SocketKind, VirtualNetwork};

fn bench_delay_model(c: &mut Criterion) {
    c.bench_function("delay_model_build", |b| {
        b.iter(|| DelayModel::build(black_box(50), black_box(10), DEFAULT_DELAY_SAMPLES));
    });

    let model = DelayModel::build(50, 10, DEFAULT_DELAY_SAMPLES);
    let mut rng = DeterministicRng::from_seed(42);
    c.bench_function("delay_model_sample", |b| {
        b.iter(|| black_box(model.sample(&mut rng)));
    });
}

fn bench_datagram_injection(c: &mut Criterion) {
    let target: SocketAddr = "10.0.0.1:9000".parse().unwrap();

    c.bench_function("datagram_send_and_deliver_1000", |b| {
        b.iter_batched(
            || {
                let network = VirtualNetwork::builder().seed(7).delay(5, 2).build();
                let receiver = network.create_socket(IpFamily::V4, SocketKind::Datagram);
                receiver.bind(target).unwrap();
                let sender = network.create_socket(IpFamily::V4, SocketKind::Datagram);
                (network, sender, receiver)
            },
            |(network, sender, receiver)| {
                for _ in 0..1000 {
                    sender.send_to(&[0u8; 256], target).unwrap();
                }
                network.process_messages_until_idle();
                let mut buf = [0u8; 256];
                while receiver.recv(&mut buf).is_ok() {}
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_stream_transfer(c: &mut Criterion) {
    let listen_addr: SocketAddr = "10.0.0.1:80".parse().unwrap();

    c.bench_function("stream_transfer_1mb", |b| {
        b.iter_batched(
            || {
                let network = VirtualNetwork::new(NetworkConfig::default());
                let listener = network.create_socket(IpFamily::V4, SocketKind::Stream);
                listener.bind(listen_addr).unwrap();
                listener.listen(1).unwrap();
                let client = network.create_socket(IpFamily::V4, SocketKind::Stream);
                client.connect(listen_addr).unwrap();
                network.process_messages_until_idle();
                let (server, _) = listener.accept().unwrap();
                network.process_messages_until_idle();
                (network, client, server)
            },
            |(network, client, server)| {
                let payload = vec![0xabu8; 16 * 1024];
                let mut buf = vec![0u8; 64 * 1024];
                let mut received = 0;
                while received < 1024 * 1024 {
                    let _ = client.send(&payload);
                    network.process_messages_until_idle();
                    while let Ok(read) = server.recv(&mut buf) {
                        received += read;
                    }
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_delay_model,
    bench_datagram_injection,
    bench_stream_transfer
);
criterion_main!(benches);
