//! Skylink Codec
//!
//! Keypoints as a compact quantized stream, not as floats.
//!
//! # Layers
//!
//! - Keyframes: every transmitted landmark quantized to `precision_bits`,
//!   self-describing, decodable with no prior state.
//! - Deltas: residuals against a motion-predicted position, quantized at
//!   `precision_bits - 2` signed bits. Points whose residual quantizes to
//!   zero are left out, which is where delta frames get their size.
//!
//! Encoder and decoder run the same prediction over the same reconstructed
//! frames, so a delta decodes to exactly what the encoder believes it sent.

pub mod codec;
pub mod packet;
pub mod predictor;
pub mod quantizer;
pub mod wire;

pub use codec::*;
pub use packet::*;
pub use predictor::*;
pub use quantizer::*;
pub use wire::{decode_packet, encode_packet, encoded_len, WIRE_HEADER_SIZE, WIRE_VERSION};
