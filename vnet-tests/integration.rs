//! Integration tests for vnet
//!
//! These tests drive the public socket API end to end: datagram exchange,
//! stream connection lifecycle, flow control, dual-stack addressing and the
//! link model (bandwidth, latency, loss).
//!
//! Every test builds its own `VirtualNetwork`, so they run independently and
//! in virtual time.

#[path = "integration/harness.rs"]
mod harness;

#[path = "integration/datagram_exchange.rs"]
mod datagram_exchange;

#[path = "integration/stream_lifecycle.rs"]
mod stream_lifecycle;

#[path = "integration/flow_control.rs"]
mod flow_control;

#[path = "integration/cross_family.rs"]
mod cross_family;

#[path = "integration/link_model.rs"]
mod link_model;
