//! Skylink Core - Fundamental types for bandwidth-adaptive pose telemetry
//!
//! This crate defines the types shared by every layer of the telemetry path:
//! - Keypoints and pose frames (33 normalized landmarks)
//! - Priority groups and the reference point set
//! - Quality levels and the quality table
//! - Frame kinds and their transport priority
//! - The error taxonomy

pub mod error;
pub mod group;
pub mod keypoint;
pub mod quality;

pub use error::*;
pub use group::*;
pub use keypoint::*;
pub use quality::*;
