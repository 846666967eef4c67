//! Skylink Runtime - sessions, control loop and receiver
//!
//! This crate ties the codec and the link together:
//! - Configuration loading and validation
//! - The adaptive controller (fps gate, quality, emergency mode)
//! - Telemetry sessions that own one codec and one link each
//! - The ground station that decodes what comes off the link
//! - Tracing setup for binaries

pub mod config;
pub mod controller;
pub mod ground;
pub mod session;
pub mod telemetry;

pub use config::{ControllerConfig, SkylinkConfig, MAX_KEYFRAME_REFRESH_SECS};
pub use controller::{AdaptiveController, DegradeReason, Mode, ModeTransition};
pub use ground::{DecodedFrame, GroundStation, GroundStats};
pub use session::{FrameOutcome, SessionStats, SessionStatus, TelemetrySession};
pub use telemetry::{init_tracing, LogFormat};
