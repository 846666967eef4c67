//! Arbitrary bytes into the wire decoder: errors are fine, panics are not.
//! Anything that decodes must re-encode to the same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skylink_codec::{decode_packet, encode_packet};

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = decode_packet(data) {
        assert_eq!(encode_packet(&packet).as_ref(), data);
    }
});
