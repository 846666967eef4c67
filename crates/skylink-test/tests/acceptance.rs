//! Cross-crate acceptance checks: codec, link and controller together

use std::time::{Duration, Instant};

use proptest::prelude::*;
use skylink_codec::{
    decode_packet, encode_packet, CodecState, EncodeRequest, KeyframePayload, KeypointCodec,
    Payload,
};
use skylink_core::{FrameKind, PointSet, QualityName, QualityTable, ReferencePoint};
use skylink_runtime::{AdaptiveController, ControllerConfig, Mode, ModeTransition};
use skylink_test::{PosePattern, SyntheticPose};
use skylink_transport::{link_quality, ChannelConfig, LinkAdapter, LinkConfig, LinkStatus};

fn controller_with_budget(budget: f64) -> AdaptiveController {
    let config = ControllerConfig {
        budget_override: Some(budget),
        ..ControllerConfig::default()
    };
    AdaptiveController::new(config, QualityTable::default())
}

#[test]
fn static_frame_at_lowest_budget_sends_reference_points() {
    let controller = controller_with_budget(0.15);
    let level = *controller.select_quality(4000.0);
    assert_eq!(level.name, QualityName::UltraLow);

    let frame = SyntheticPose::still().next_frame();
    let mut state = CodecState::new();
    let request = EncodeRequest::keyframe().with_point_set(PointSet::Reference);
    let packet = KeypointCodec::compress(&frame, &level, request, &mut state).unwrap();

    let decoded = decode_packet(&encode_packet(&packet)).unwrap();
    assert_eq!(decoded.kind(), FrameKind::Keyframe);
    let Payload::Keyframe(KeyframePayload::Reference(points)) = &decoded.payload else {
        panic!("expected reference keyframe, got {:?}", decoded.payload);
    };
    let names: Vec<_> = points.keys().map(|p| p.name()).collect();
    assert_eq!(names, vec!["head", "shoulder_l", "shoulder_r"]);
    assert!(points.values().all(|p| p.x <= 15 && p.y <= 15));
    assert_eq!(points.len(), ReferencePoint::ALL.len());
}

#[test]
fn fresh_link_numbers_from_zero() {
    let link = LinkAdapter::new(LinkConfig::default(), ChannelConfig::default());
    assert_eq!(link.send(vec![1u8; 8], 1), Some(0));
    assert_eq!(link.send(vec![2u8; 8], 0), Some(1));
}

#[test]
fn one_second_latency_is_half_quality() {
    assert_eq!(link_quality(1.0), 0.5);
}

#[test]
fn emergency_entry_and_recovery() {
    let mut controller = AdaptiveController::new(ControllerConfig::default(), QualityTable::default());
    let degraded = LinkStatus {
        quality: 0.2,
        bandwidth_estimate: 1000.0,
        ..LinkStatus::default()
    };
    assert!(matches!(
        controller.observe_link(&degraded),
        ModeTransition::EnteredEmergency(_)
    ));
    assert_eq!(controller.point_set(), PointSet::Reference);
    assert_eq!(controller.keyframe_refresh(), Duration::from_secs(3));

    let recovered = LinkStatus {
        quality: 0.6,
        ..degraded
    };
    assert_eq!(controller.observe_link(&recovered), ModeTransition::ExitedEmergency);
    assert_eq!(controller.mode(), Mode::Normal);
    assert_eq!(controller.keyframe_refresh(), Duration::from_secs(2));
}

#[test]
fn static_sequence_keeps_base_interval() {
    let table = QualityTable::default();
    let level = *table.get(QualityName::Medium).unwrap();
    let mut state = CodecState::new();
    for (i, frame) in SyntheticPose::still().take(12).enumerate() {
        let request = if i == 0 {
            EncodeRequest::keyframe()
        } else {
            EncodeRequest::delta()
        };
        KeypointCodec::compress(&frame, &level, request, &mut state).unwrap();
    }

    let motion = f64::from(state.motion_intensity());
    assert_eq!(motion, 0.0);
    let controller = AdaptiveController::new(ControllerConfig::default(), table.clone());
    assert_eq!(
        controller.adjusted_keyframe_interval(level.keyframe_interval, motion),
        level.keyframe_interval
    );
}

#[test]
fn emergency_flush_leaves_link_empty() {
    let link = LinkAdapter::new(LinkConfig::default(), ChannelConfig::lossless(300));
    let t0 = Instant::now();
    for i in 0..5u8 {
        link.send_at(vec![i; 40], i % 2, t0);
    }
    link.tick(t0 + Duration::from_millis(100));
    link.tick(t0 + Duration::from_millis(500));

    link.emergency_mode_at(t0 + Duration::from_millis(600));
    let status = link.tick(t0 + Duration::from_millis(700));
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.pending, 0);
    assert!(link.try_receive().is_none());
    assert_eq!(link.send(vec![9u8; 4], 0), Some(5));
}

proptest! {
    #[test]
    fn delta_stream_decodes_identically(seed in any::<u64>(), len in 2usize..40) {
        let table = QualityTable::default();
        let level = *table.get(QualityName::Low).unwrap();
        let mut sender = CodecState::new();
        let mut receiver = CodecState::new();

        let source = SyntheticPose::new(PosePattern::Jitter { amplitude: 0.03 }, seed);
        for (i, frame) in source.take(len).enumerate() {
            let request = if i == 0 {
                EncodeRequest::keyframe()
            } else {
                EncodeRequest::delta()
            };
            let packet = KeypointCodec::compress(&frame, &level, request, &mut sender).unwrap();
            let packet = decode_packet(&encode_packet(&packet)).unwrap();
            let decoded = KeypointCodec::decompress(&packet, &mut receiver).unwrap();
            prop_assert_eq!(Some(&decoded), sender.reference());
        }
    }

    #[test]
    fn bandwidth_budget_never_lowers_quality(a in 0.0f64..1.0, b in 0.0f64..1.0) {
        let table = QualityTable::default();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let lo_index = table.index_of(table.select(lo).name).unwrap();
        let hi_index = table.index_of(table.select(hi).name).unwrap();
        prop_assert!(lo_index <= hi_index);
    }
}
