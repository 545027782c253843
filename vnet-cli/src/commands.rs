//! CLI command implementations

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use tracing::info;
use vnet_core::{IpFamily, NetworkConfig, SocketError, VnetError};
use vnet_sim::deterministic::DeterministicRng;
use vnet_sim::{ConnState, DelayModel, SocketKind, VirtualNetwork, standard_invariants};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Send datagrams between two sockets and report delivery
    UdpExchange {
        /// Number of datagrams to send
        #[arg(short, long, default_value = "100")]
        count: u32,
        /// Payload size of each datagram in bytes
        #[arg(short, long, default_value = "512")]
        size: usize,
    },
    /// Transfer bytes over a stream connection and report timing
    Stream {
        /// Number of bytes to transfer
        #[arg(short, long, default_value = "1048576")]
        bytes: usize,
    },
    /// Sample the configured latency distribution
    Latency {
        /// Number of samples to draw
        #[arg(short, long, default_value = "10000")]
        samples: usize,
    },
}

/// Runs the selected command against a network built from `config`.
///
/// # Errors
///
/// - `VnetError::Socket` - A socket operation failed unexpectedly
/// - `VnetError::Scenario` - The scenario did not complete
pub fn run_command(command: Commands, config: NetworkConfig) -> anyhow::Result<()> {
    match command {
        Commands::UdpExchange { count, size } => udp_exchange(config, count, size),
        Commands::Stream { bytes } => stream_transfer(config, bytes),
        Commands::Latency { samples } => latency(&config, samples),
    }
}

fn build_network(config: NetworkConfig) -> VirtualNetwork {
    let mut builder = VirtualNetwork::builder().config(config);
    for invariant in standard_invariants() {
        builder = builder.invariant(invariant);
    }
    builder.build()
}

fn server_address() -> SocketAddr {
    SocketAddr::new(IpFamily::V4.loopback_ip(), 5000)
}

/// Sends `count` datagrams of `size` bytes and counts what arrives
fn udp_exchange(config: NetworkConfig, count: u32, size: usize) -> anyhow::Result<()> {
    let network = build_network(config);
    let receiver = network.create_socket(IpFamily::V4, SocketKind::Datagram);
    receiver.bind(server_address())?;
    let sender = network.create_socket(IpFamily::V4, SocketKind::Datagram);

    let payload = vec![0xA5u8; size];
    for _ in 0..count {
        sender
            .send_to(&payload, server_address())
            .context("sending datagram")?;
    }
    let report = network.process_messages_until_idle();

    let mut delivered = 0u32;
    let mut buf = vec![0u8; size.max(1)];
    while receiver.recv(&mut buf).is_ok() {
        delivered += 1;
    }

    println!("UDP exchange (seed {})", network.seed());
    println!("{:-<60}", "");
    println!("Sent: {count} datagrams of {size} bytes");
    println!("Delivered: {delivered}");
    println!("Virtual time: {:?}", report.elapsed);
    println!("{}", network.stats());
    print_violations(&report.violations);
    Ok(())
}

/// Pushes `total` bytes through a stream connection with flow control
fn stream_transfer(config: NetworkConfig, total: usize) -> anyhow::Result<()> {
    let network = build_network(config);
    let listener = network.create_socket(IpFamily::V4, SocketKind::Stream);
    listener.bind(server_address())?;
    listener.listen(1)?;

    let client = network.create_socket(IpFamily::V4, SocketKind::Stream);
    client.connect(server_address())?;
    network.process_messages_until_idle();
    let (server, peer) = listener.accept()?;
    network.process_messages_until_idle();
    if client.state() != ConnState::Connected {
        return Err(VnetError::Scenario {
            reason: format!("client ended up {:?} instead of connected", client.state()),
        }
        .into());
    }
    info!(%peer, "Stream connection established");

    let payload = vec![0x5Au8; total];
    let mut sent = 0;
    let mut received = 0;
    let mut buf = vec![0u8; 64 * 1024];
    let start = network.elapsed();

    while received < total {
        if sent < total {
            match client.send(&payload[sent..]) {
                Ok(count) => sent += count,
                Err(SocketError::WouldBlock) => {}
                Err(error) => return Err(error).context("sending stream data"),
            }
        }
        let step = network.process_for(Duration::from_millis(10));
        loop {
            match server.recv(&mut buf) {
                Ok(read) => received += read,
                Err(SocketError::WouldBlock) => break,
                Err(error) => return Err(error).context("receiving stream data"),
            }
        }
        let idle = step.events_processed == 0 && network.pending_events() == 0;
        if idle && sent == total && received < total {
            bail!("transfer stalled after {received} of {total} bytes");
        }
    }
    let elapsed = network.elapsed() - start;
    client.close()?;
    let report = network.process_messages_until_idle();

    let seconds = elapsed.as_secs_f64();
    println!("Stream transfer (seed {})", network.seed());
    println!("{:-<60}", "");
    println!("Transferred: {received} bytes");
    println!("Virtual time: {elapsed:?}");
    if seconds > 0.0 {
        println!("Throughput: {:.1} KB/s", received as f64 / 1024.0 / seconds);
    }
    println!("{}", network.stats());
    print_violations(&report.violations);
    Ok(())
}

/// Draws `samples` delays and prints summary statistics
fn latency(config: &NetworkConfig, samples: usize) -> anyhow::Result<()> {
    if samples == 0 {
        bail!("at least one sample is required");
    }
    let model = DelayModel::build(
        config.delay_mean_ms,
        config.delay_stddev_ms,
        config.delay_samples,
    );
    let mut rng = DeterministicRng::from_seed(config.seed);
    let mut delays: Vec<u32> = (0..samples).map(|_| model.sample(&mut rng)).collect();
    delays.sort_unstable();

    let count = delays.len() as f64;
    let mean = delays.iter().map(|d| f64::from(*d)).sum::<f64>() / count;
    let variance = delays
        .iter()
        .map(|d| (f64::from(*d) - mean).powi(2))
        .sum::<f64>()
        / count;
    let percentile = |p: f64| delays[((count - 1.0) * p) as usize];

    println!(
        "Latency model: mean {} ms, stddev {} ms",
        model.mean(),
        model.stddev()
    );
    println!("{:-<60}", "");
    println!("Samples: {samples}");
    println!("Observed mean: {mean:.2} ms");
    println!("Observed stddev: {:.2} ms", variance.sqrt());
    println!(
        "Min / p50 / p99 / max: {} / {} / {} / {} ms",
        percentile(0.0),
        percentile(0.5),
        percentile(0.99),
        percentile(1.0)
    );
    Ok(())
}

fn print_violations(violations: &[vnet_sim::InvariantViolation]) {
    if violations.is_empty() {
        return;
    }
    println!("\nInvariant violations:");
    for violation in violations {
        println!("  {violation}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_exchange_runs() {
        let config = NetworkConfig::deterministic_testing();
        assert!(udp_exchange(config, 10, 64).is_ok());
    }

    #[test]
    fn test_stream_transfer_runs_under_bandwidth_limit() {
        let config = NetworkConfig {
            bandwidth: 64 * 1024,
            delay_mean_ms: 20,
            ..NetworkConfig::deterministic_testing()
        };
        assert!(stream_transfer(config, 100_000).is_ok());
    }

    #[test]
    fn test_latency_rejects_zero_samples() {
        let config = NetworkConfig::default();
        assert!(latency(&config, 0).is_err());
        assert!(latency(&config, 100).is_ok());
    }
}
