//! Versioned binary packing of compressed packets
//!
//! Header is 9 bytes:
//! - Byte 0: Version
//! - Byte 1: Flags (0x01 keyframe, 0x02 reference point set)
//! - Byte 2: Quality level
//! - Byte 3: Precision bits
//! - Bytes 4-7: Frame number (LE)
//! - Byte 8: Point count
//!
//! The body is a bit stream, most significant bit first, zero-padded to a
//! whole byte. Which landmarks it covers follows from the header alone:
//! every slot is a landmark below the point count, walked group by group in
//! ascending index order (reference points in name order for a reference
//! set), so no indices or counts go on the wire.
//! - Keyframe slot: `x` and `y` at `precision_bits` each, confidence at 7 bits
//! - Delta slot: one presence bit; if set, `dx` and `dy` as two's complement
//!   at `precision_bits - 2` bits each
//!
//! Every packet has exactly one encoding. Decoding rejects non-zero padding,
//! trailing bytes, confidence above 100, out-of-range residuals and present
//! residuals that are zero.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use skylink_core::{
    PointSet, PriorityGroup, QualityName, ReferencePoint, SkylinkError, SkylinkResult,
    MAX_PRECISION_BITS, MIN_PRECISION_BITS, POSE_LANDMARK_COUNT,
};

use crate::{
    CompressedPacket, DeltaPayload, KeyframePayload, Payload, QuantizedPoint, Quantizer, Residual,
};

/// Current wire format version
pub const WIRE_VERSION: u8 = 2;

/// Fixed header size in bytes
pub const WIRE_HEADER_SIZE: usize = 9;

const FLAG_KEYFRAME: u8 = 0x01;
const FLAG_REFERENCE_SET: u8 = 0x02;
const KNOWN_FLAGS: u8 = FLAG_KEYFRAME | FLAG_REFERENCE_SET;

/// Whole percent fits in 7 bits
const CONFIDENCE_BITS: u8 = 7;

const BLANK_POINT: QuantizedPoint = QuantizedPoint {
    x: 0,
    y: 0,
    confidence: 0,
};

/// Landmarks a body covers, in wire order
fn slots(point_count: u8, point_set: PointSet) -> impl Iterator<Item = (PriorityGroup, usize)> {
    let point_count = usize::from(point_count);
    PriorityGroup::ALL.into_iter().flat_map(move |group| {
        group
            .indices()
            .iter()
            .copied()
            .filter(move |&idx| idx < point_count && point_set.includes(idx))
            .map(move |idx| (group, idx))
    })
}

/// Precision used for packing; decoding rejects anything outside the range
fn wire_quantizer(packet: &CompressedPacket) -> Quantizer {
    Quantizer::new(
        packet
            .precision_bits
            .clamp(MIN_PRECISION_BITS, MAX_PRECISION_BITS),
    )
}

fn keyframe_point(keyframe: &KeyframePayload, idx: usize) -> Option<QuantizedPoint> {
    match keyframe {
        KeyframePayload::Groups(groups) => {
            let group = PriorityGroup::of(idx)?;
            let slot = group.indices().iter().position(|&i| i == idx)?;
            groups.get(&group)?.get(slot).copied()
        }
        KeyframePayload::Reference(points) => ReferencePoint::ALL
            .into_iter()
            .find(|point| point.index() == idx)
            .and_then(|point| points.get(&point).copied()),
    }
}

/// Non-zero residuals by landmark; zero residuals are never sent
fn present_residuals(delta: &DeltaPayload) -> BTreeMap<usize, Residual> {
    delta
        .residuals()
        .filter(|(_, r)| r.dx != 0 || r.dy != 0)
        .map(|(_, r)| (usize::from(r.index), *r))
        .collect()
}

/// Exact encoded size of a packet
pub fn encoded_len(packet: &CompressedPacket) -> usize {
    let quantizer = wire_quantizer(packet);
    let slots = slots(packet.point_count, packet.point_set);
    let body_bits: usize = match &packet.payload {
        Payload::Keyframe(_) => {
            let per_point = 2 * usize::from(quantizer.precision_bits()) + usize::from(CONFIDENCE_BITS);
            slots.count() * per_point
        }
        Payload::Delta(delta) => {
            let present = present_residuals(delta);
            let per_residual = 2 * usize::from(quantizer.delta_bits());
            slots
                .map(|(_, idx)| {
                    if present.contains_key(&idx) {
                        1 + per_residual
                    } else {
                        1
                    }
                })
                .sum()
        }
    };
    WIRE_HEADER_SIZE + (body_bits + 7) / 8
}

/// Pack a packet for the link
pub fn encode_packet(packet: &CompressedPacket) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(packet));

    let mut flags = 0u8;
    if packet.is_keyframe() {
        flags |= FLAG_KEYFRAME;
    }
    if packet.point_set == PointSet::Reference {
        flags |= FLAG_REFERENCE_SET;
    }

    buf.put_u8(WIRE_VERSION);
    buf.put_u8(flags);
    buf.put_u8(packet.quality.to_byte());
    buf.put_u8(packet.precision_bits);
    buf.put_u32_le(packet.frame_number);
    buf.put_u8(packet.point_count);

    let quantizer = wire_quantizer(packet);
    let mut bits = BitWriter::new(buf);
    match &packet.payload {
        Payload::Keyframe(keyframe) => {
            let width = quantizer.precision_bits();
            for (_, idx) in slots(packet.point_count, packet.point_set) {
                let point = keyframe_point(keyframe, idx).unwrap_or(BLANK_POINT);
                bits.put(u32::from(point.x), width);
                bits.put(u32::from(point.y), width);
                bits.put(u32::from(point.confidence), CONFIDENCE_BITS);
            }
        }
        Payload::Delta(delta) => {
            let present = present_residuals(delta);
            let width = quantizer.delta_bits();
            for (_, idx) in slots(packet.point_count, packet.point_set) {
                match present.get(&idx) {
                    Some(residual) => {
                        bits.put(1, 1);
                        bits.put_signed(residual.dx, width);
                        bits.put_signed(residual.dy, width);
                    }
                    None => bits.put(0, 1),
                }
            }
        }
    }

    bits.finish().freeze()
}

/// Unpack and validate a packet
pub fn decode_packet(data: &[u8]) -> SkylinkResult<CompressedPacket> {
    let mut reader = Reader::new(data);

    reader.require(WIRE_HEADER_SIZE)?;
    let version = reader.u8()?;
    if version != WIRE_VERSION {
        return Err(SkylinkError::UnsupportedVersion(version));
    }

    let flags = reader.u8()?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(invalid(format!("unknown flags {:#04x}", flags)));
    }
    let keyframe = flags & FLAG_KEYFRAME != 0;
    let point_set = if flags & FLAG_REFERENCE_SET != 0 {
        PointSet::Reference
    } else {
        PointSet::Full
    };

    let quality = QualityName::from_byte(reader.u8()?)?;
    let precision_bits = reader.u8()?;
    if !(MIN_PRECISION_BITS..=MAX_PRECISION_BITS).contains(&precision_bits) {
        return Err(invalid(format!("precision {} out of range", precision_bits)));
    }
    let frame_number = reader.u32()?;
    let point_count = reader.u8()?;
    if point_count as usize > POSE_LANDMARK_COUNT {
        return Err(invalid(format!("point count {} exceeds {}", point_count, POSE_LANDMARK_COUNT)));
    }

    let quantizer = Quantizer::new(precision_bits);
    let mut bits = BitReader::new(reader.rest(), WIRE_HEADER_SIZE);
    let payload = match (keyframe, point_set) {
        (true, PointSet::Full) => {
            let mut groups: BTreeMap<PriorityGroup, Vec<QuantizedPoint>> = BTreeMap::new();
            for (group, _) in slots(point_count, point_set) {
                groups
                    .entry(group)
                    .or_default()
                    .push(read_point(&mut bits, &quantizer)?);
            }
            Payload::Keyframe(KeyframePayload::Groups(groups))
        }
        (true, PointSet::Reference) => {
            let mut points = BTreeMap::new();
            for (reference, _) in ReferencePoint::ALL
                .into_iter()
                .map(|point| (point, point.index()))
                .filter(|&(_, idx)| idx < usize::from(point_count))
            {
                points.insert(reference, read_point(&mut bits, &quantizer)?);
            }
            Payload::Keyframe(KeyframePayload::Reference(points))
        }
        (false, _) => Payload::Delta(read_delta(&mut bits, &quantizer, point_count, point_set)?),
    };

    bits.finish()?;

    Ok(CompressedPacket {
        frame_number,
        quality,
        precision_bits,
        point_set,
        point_count,
        payload,
    })
}

fn read_delta(
    bits: &mut BitReader<'_>,
    quantizer: &Quantizer,
    point_count: u8,
    point_set: PointSet,
) -> SkylinkResult<DeltaPayload> {
    let width = quantizer.delta_bits();
    let max_delta = quantizer.max_delta().unsigned_abs();
    let mut delta = DeltaPayload::new();
    for (group, idx) in slots(point_count, point_set) {
        if bits.get(1)? == 0 {
            continue;
        }
        let dx = bits.get_signed(width)?;
        let dy = bits.get_signed(width)?;
        if dx == 0 && dy == 0 {
            return Err(invalid(format!("zero residual sent for landmark {}", idx)));
        }
        if dx.unsigned_abs() > max_delta || dy.unsigned_abs() > max_delta {
            return Err(invalid(format!("residual for landmark {} out of range", idx)));
        }
        delta.push(
            group,
            Residual {
                index: idx as u8,
                dx,
                dy,
            },
        );
    }
    Ok(delta)
}

fn read_point(bits: &mut BitReader<'_>, quantizer: &Quantizer) -> SkylinkResult<QuantizedPoint> {
    let width = quantizer.precision_bits();
    let point = QuantizedPoint {
        x: bits.get(width)? as u16,
        y: bits.get(width)? as u16,
        confidence: bits.get(CONFIDENCE_BITS)? as u8,
    };
    if point.confidence > 100 {
        return Err(invalid(format!("confidence {} above 100", point.confidence)));
    }
    Ok(point)
}

fn invalid(msg: String) -> SkylinkError {
    SkylinkError::InvalidWireFormat(msg)
}

#[inline]
fn mask(width: u8) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}

/// Bounds-checked little endian cursor for the header
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn require(&self, n: usize) -> SkylinkResult<()> {
        if self.remaining() < n {
            return Err(SkylinkError::BufferTooShort {
                expected: self.pos + n,
                actual: self.buf.len(),
            });
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> SkylinkResult<[u8; N]> {
        self.require(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn u8(&mut self) -> SkylinkResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> SkylinkResult<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }
}

/// MSB-first bit packer appending to a byte buffer
struct BitWriter {
    buf: BytesMut,
    acc: u64,
    filled: u8,
}

impl BitWriter {
    fn new(buf: BytesMut) -> Self {
        Self {
            buf,
            acc: 0,
            filled: 0,
        }
    }

    /// Append the low `width` bits of `value`, `width <= 32`
    fn put(&mut self, value: u32, width: u8) {
        let width = width.min(32);
        self.acc = (self.acc << width) | u64::from(value & mask(width));
        self.filled += width;
        while self.filled >= 8 {
            self.filled -= 8;
            self.buf.put_u8((self.acc >> self.filled) as u8);
        }
        self.acc &= (1u64 << self.filled) - 1;
    }

    /// Two's complement in `width` bits
    fn put_signed(&mut self, value: i16, width: u8) {
        self.put(i32::from(value) as u32, width);
    }

    /// Flush the last partial byte, zero-padded
    fn finish(mut self) -> BytesMut {
        if self.filled > 0 {
            let pad = 8 - self.filled;
            self.buf.put_u8((self.acc << pad) as u8);
            self.filled = 0;
        }
        self.buf
    }
}

/// MSB-first bit cursor over a packet body
struct BitReader<'a> {
    buf: &'a [u8],
    bit: usize,
    /// Bytes before the body, for error reporting
    offset: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8], offset: usize) -> Self {
        Self {
            buf,
            bit: 0,
            offset,
        }
    }

    fn get(&mut self, width: u8) -> SkylinkResult<u32> {
        let width = usize::from(width.min(32));
        let end = self.bit + width;
        if end > self.buf.len() * 8 {
            return Err(SkylinkError::BufferTooShort {
                expected: self.offset + (end + 7) / 8,
                actual: self.offset + self.buf.len(),
            });
        }
        let mut value = 0u32;
        for bit in self.bit..end {
            let byte = self.buf[bit / 8];
            value = (value << 1) | u32::from((byte >> (7 - bit % 8)) & 1);
        }
        self.bit = end;
        Ok(value)
    }

    /// Sign-extend a `width`-bit two's complement field
    fn get_signed(&mut self, width: u8) -> SkylinkResult<i16> {
        let raw = self.get(width)?;
        let shift = 32 - u32::from(width.clamp(1, 32));
        Ok((((raw << shift) as i32) >> shift) as i16)
    }

    /// The body must end in this byte, padded with zeros
    fn finish(&self) -> SkylinkResult<()> {
        let used = (self.bit + 7) / 8;
        if self.bit % 8 != 0 {
            let last = self.buf[used - 1];
            if last & (mask(8 - (self.bit % 8) as u8) as u8) != 0 {
                return Err(invalid("non-zero padding bits".into()));
            }
        }
        if self.buf.len() > used {
            return Err(invalid(format!("{} trailing bytes", self.buf.len() - used)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodecState, EncodeRequest, KeypointCodec};
    use proptest::prelude::*;
    use skylink_core::{Keypoint, PoseFrame, QualityLevel, QualityTable};

    fn frame(shift: f32) -> PoseFrame {
        PoseFrame::new(
            (0..POSE_LANDMARK_COUNT)
                .map(|i| Keypoint::new(0.3 + shift + i as f32 * 0.01, 0.6 - i as f32 * 0.01))
                .collect(),
        )
    }

    fn packets() -> Vec<CompressedPacket> {
        let table = QualityTable::default();
        let level = table.levels[2];
        let mut state = CodecState::new();
        let mut out = Vec::new();
        out.push(
            KeypointCodec::compress(&frame(0.0), &level, EncodeRequest::keyframe(), &mut state)
                .unwrap(),
        );
        out.push(
            KeypointCodec::compress(&frame(0.05), &level, EncodeRequest::delta(), &mut state)
                .unwrap(),
        );
        let reference = EncodeRequest::keyframe().with_point_set(PointSet::Reference);
        out.push(KeypointCodec::compress(&frame(0.1), &level, reference, &mut state).unwrap());
        out
    }

    /// Header for a hand-built body
    fn header(flags: u8, precision_bits: u8) -> Vec<u8> {
        let mut bytes = vec![WIRE_VERSION, flags, QualityName::Medium.to_byte(), precision_bits];
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.push(POSE_LANDMARK_COUNT as u8);
        bytes
    }

    fn sizes(request: impl Fn(usize) -> EncodeRequest, level: &QualityLevel) -> Vec<usize> {
        let mut state = CodecState::new();
        [frame(0.0), frame(0.3)]
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let packet = KeypointCodec::compress(f, level, request(i), &mut state).unwrap();
                encode_packet(&packet).len()
            })
            .collect()
    }

    #[test]
    fn test_packets_survive_the_wire() {
        for packet in packets() {
            let bytes = encode_packet(&packet);
            assert_eq!(bytes.len(), encoded_len(&packet));
            assert_eq!(decode_packet(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn test_header_layout() {
        let packet = &packets()[2];
        let bytes = encode_packet(packet);
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(bytes[1], FLAG_KEYFRAME | FLAG_REFERENCE_SET);
        assert_eq!(bytes[2], QualityName::Medium.to_byte());
        assert_eq!(bytes[3], 8);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 3);
        assert_eq!(bytes[8], 33);
        // Three reference points of 8 + 8 + 7 bits, padded to a byte.
        assert_eq!(bytes.len(), WIRE_HEADER_SIZE + 9);
    }

    #[test]
    fn test_precision_sets_the_size() {
        let table = QualityTable::default();
        let keyframes: Vec<usize> = table
            .levels
            .iter()
            .map(|level| sizes(|_| EncodeRequest::keyframe(), level)[0])
            .collect();
        let deltas: Vec<usize> = table
            .levels
            .iter()
            .map(|level| {
                sizes(
                    |i| {
                        if i == 0 {
                            EncodeRequest::keyframe()
                        } else {
                            EncodeRequest::delta()
                        }
                    },
                    level,
                )[1]
            })
            .collect();

        // 33 points of 2p + 7 bits.
        assert_eq!(keyframes, vec![9 + 62, 9 + 79, 9 + 95, 9 + 112]);
        // Every landmark moved: 33 presence bits plus 2 (p - 2) bits each.
        assert_eq!(deltas, vec![9 + 21, 9 + 38, 9 + 54, 9 + 71]);
        assert!(keyframes.windows(2).all(|w| w[0] < w[1]));
        assert!(deltas.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode_packet(&packets()[0]);
        for len in [0, 4, WIRE_HEADER_SIZE, bytes.len() - 1] {
            assert!(matches!(
                decode_packet(&bytes[..len]),
                Err(SkylinkError::BufferTooShort { .. })
            ));
        }
    }

    #[test]
    fn test_rejects_bad_header() {
        let mut bytes = encode_packet(&packets()[0]).to_vec();
        bytes[0] = 7;
        assert_eq!(decode_packet(&bytes), Err(SkylinkError::UnsupportedVersion(7)));

        let mut bytes = encode_packet(&packets()[0]).to_vec();
        bytes[1] |= 0x80;
        assert!(matches!(decode_packet(&bytes), Err(SkylinkError::InvalidWireFormat(_))));

        let mut bytes = encode_packet(&packets()[0]).to_vec();
        bytes[3] = 17;
        assert!(matches!(decode_packet(&bytes), Err(SkylinkError::InvalidWireFormat(_))));

        let mut bytes = encode_packet(&packets()[0]).to_vec();
        bytes[2] = 9;
        assert_eq!(decode_packet(&bytes), Err(SkylinkError::UnknownQualityLevel(9)));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = encode_packet(&packets()[1]).to_vec();
        bytes.push(0);
        assert!(matches!(decode_packet(&bytes), Err(SkylinkError::InvalidWireFormat(_))));
    }

    #[test]
    fn test_rejects_padding_bits() {
        // 69 body bits leave three bits of padding.
        let mut bytes = encode_packet(&packets()[2]).to_vec();
        *bytes.last_mut().unwrap() |= 0x01;
        assert!(matches!(decode_packet(&bytes), Err(SkylinkError::InvalidWireFormat(_))));
    }

    #[test]
    fn test_rejects_zero_residual() {
        // Head present with dx = dy = 0 at 6 bits each, shoulders absent.
        let mut bytes = header(FLAG_REFERENCE_SET, 8);
        bytes.extend_from_slice(&[0b1000_0000, 0b0000_0000]);
        assert!(matches!(decode_packet(&bytes), Err(SkylinkError::InvalidWireFormat(_))));
    }

    #[test]
    fn test_rejects_residual_out_of_range() {
        // At 4 bits residuals get 2 bits; 0b10 is -2, one past the limit.
        let mut bytes = header(FLAG_REFERENCE_SET, 4);
        bytes.push(0b1100_0000);
        assert!(matches!(decode_packet(&bytes), Err(SkylinkError::InvalidWireFormat(_))));

        let mut bytes = header(FLAG_REFERENCE_SET, 4);
        bytes.push(0b1010_0000);
        let packet = decode_packet(&bytes).unwrap();
        let Payload::Delta(delta) = &packet.payload else {
            panic!("expected a delta, got {:?}", packet.payload);
        };
        assert_eq!(
            delta.residuals().map(|(_, r)| *r).collect::<Vec<_>>(),
            vec![Residual { index: 0, dx: 1, dy: 0 }]
        );
        assert_eq!(encode_packet(&packet).as_ref(), &bytes[..]);
    }

    #[test]
    fn test_rejects_confidence_above_100() {
        // First reference point: x = y = 0, confidence 127.
        let mut bytes = header(FLAG_KEYFRAME | FLAG_REFERENCE_SET, 4);
        bytes.extend_from_slice(&[0x00, 0xFE, 0x00, 0x00, 0x00, 0x00]);
        assert!(matches!(decode_packet(&bytes), Err(SkylinkError::InvalidWireFormat(_))));
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_packet(&data);
        }

        #[test]
        fn prop_decode_versioned_noise(mut data in proptest::collection::vec(any::<u8>(), 9..128)) {
            data[0] = WIRE_VERSION;
            data[1] &= KNOWN_FLAGS;
            if let Ok(packet) = decode_packet(&data) {
                let encoded = encode_packet(&packet);
                prop_assert_eq!(encoded.as_ref(), &data[..]);
            }
        }
    }
}
