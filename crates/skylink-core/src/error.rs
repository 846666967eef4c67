//! Error types for Skylink telemetry

use thiserror::Error;

/// Core Skylink errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkylinkError {
    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown quality level: {0}")]
    UnknownQualityLevel(u8),

    // Codec errors
    #[error("Delta frame has no reference keyframe")]
    MissingReferenceFrame,

    #[error("Reference gap: expected frame {expected}, got {actual}")]
    ReferenceGap { expected: u32, actual: u32 },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Link closed")]
    LinkClosed,
}

/// Result type for Skylink operations
pub type SkylinkResult<T> = Result<T, SkylinkError>;
