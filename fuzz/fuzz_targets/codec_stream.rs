//! Arbitrary frame streams through encoder and decoder.
//!
//! Whatever the encoder is asked to do, the decoder fed the same packets
//! must land on the same reconstruction.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use skylink_codec::{decode_packet, encode_packet, CodecState, EncodeRequest, KeypointCodec};
use skylink_core::{Keypoint, PointSet, PoseFrame, QualityTable};

#[derive(Arbitrary, Debug)]
struct Step {
    keyframe: bool,
    reference_only: bool,
    level: u8,
    points: Vec<(u16, u16, Option<u8>)>,
}

fuzz_target!(|steps: Vec<Step>| {
    let table = QualityTable::default();
    let mut sender = CodecState::new();
    let mut receiver = CodecState::new();

    for step in steps.iter().take(64) {
        let level = &table.levels[step.level as usize % table.levels.len()];
        let frame = PoseFrame::new(
            step.points
                .iter()
                .take(40)
                .map(|&(x, y, confidence)| {
                    let point = Keypoint::new(x as f32 / 65535.0, y as f32 / 65535.0);
                    match confidence {
                        Some(c) => point.with_confidence(c as f32 / 255.0),
                        None => point,
                    }
                })
                .collect(),
        );
        let mut request = if step.keyframe {
            EncodeRequest::keyframe()
        } else {
            EncodeRequest::delta()
        };
        if step.reference_only {
            request = request.with_point_set(PointSet::Reference);
        }

        let Some(packet) = KeypointCodec::compress(&frame, level, request, &mut sender) else {
            continue;
        };
        let packet = decode_packet(&encode_packet(&packet)).expect("encoder output must decode");
        let decoded = KeypointCodec::decompress(&packet, &mut receiver)
            .expect("decoder in lockstep must accept every packet");
        assert_eq!(Some(&decoded), sender.reference());
    }
});
