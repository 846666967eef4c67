//! Skylink Test Harness - synthetic poses and link scenarios
//!
//! This crate provides:
//! - Deterministic synthetic pose sources (static, sway, jitter, walk)
//! - A scenario harness that runs a session and a ground station over the
//!   simulated link on synthetic time
//! - Codec and wire benchmarks

pub mod scenario;
pub mod source;

pub use scenario::*;
pub use source::*;
