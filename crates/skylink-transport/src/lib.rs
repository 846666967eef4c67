//! Skylink Transport - the simulated constrained link
//!
//! This crate provides:
//! - A seeded satellite channel model (latency, jitter, loss, capacity)
//! - The link adapter: sequencing, priority queue, pending acks, monitor task
//! - Link status snapshots and the quality formula
//! - A sliding-window bandwidth monitor for outgoing streams
//!
//! Nothing here opens a socket. The adapter is a policy simulator that the
//! runtime drives exactly as it would drive a real uplink.

pub mod bandwidth;
pub mod channel;
pub mod link;
pub mod status;

pub use bandwidth::BandwidthMonitor;
pub use channel::{ChannelConfig, ChannelStats, Delivery, SimulatedChannel};
pub use link::{LinkAdapter, LinkConfig, MonitorHandle, PendingPacket};
pub use status::{link_quality, LinkSnapshot, LinkStatus, MAX_LINK_QUALITY, MIN_LINK_QUALITY};
