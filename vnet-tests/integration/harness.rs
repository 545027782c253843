//! Shared setup for the integration tests.

use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;
use vnet_core::IpFamily;
use vnet_sim::VirtualSocket;

/// Routes simulator logs to the test harness. Set `RUST_LOG=vnet_sim=trace`
/// to see every dispatched event.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// `0.0.0.0:0` or `[::]:0`.
pub fn any(family: IpFamily) -> SocketAddr {
    family.any_address()
}

/// Reads one datagram or segment, panicking when nothing is queued.
pub fn recv_packet(socket: &VirtualSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 64 * 1024];
    let (read, from) = socket
        .recv_from(&mut buf)
        .unwrap_or_else(|e| panic!("socket {} had nothing queued: {e}", socket.id()));
    buf.truncate(read);
    (buf, from)
}

/// Reads until the socket would block and returns everything read.
pub fn drain(socket: &VirtualSocket) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while let Ok(read) = socket.recv(&mut buf) {
        received.extend_from_slice(&buf[..read]);
    }
    received
}
