//! Wire-codec laws that must hold for arbitrary inputs.

use kestrel_core::tlv::{
    self, decode_double, decode_float, decode_int, encode_double, encode_eol, encode_float,
    encode_int64, encode_string, Tag, TlvReader,
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_int64_round_trip(x in any::<u64>()) {
        let mut buf = Vec::new();
        encode_int64(&mut buf, Tag::CommandCount, x);
        let (tag, value) = TlvReader::new(&buf).next().unwrap();
        prop_assert_eq!(tag, Tag::CommandCount);
        prop_assert_eq!(decode_int(value), x);
        // Leading-zero suppression: the value never occupies more bytes
        // than its magnitude needs
        let min_len = if x == 0 { 0 } else { 8 - x.leading_zeros() as usize / 8 };
        prop_assert_eq!(value.len(), min_len);
    }

    #[test]
    fn prop_float_round_trip(x in any::<f32>()) {
        let mut buf = Vec::new();
        let wrote = encode_float(&mut buf, Tag::RfGain, x);
        if x.is_nan() {
            prop_assert_eq!(wrote, 0);
        } else {
            let (_, value) = TlvReader::new(&buf).next().unwrap();
            prop_assert_eq!(decode_float(value).to_bits(), x.to_bits());
        }
    }

    #[test]
    fn prop_double_round_trip(x in any::<f64>()) {
        let mut buf = Vec::new();
        let wrote = encode_double(&mut buf, Tag::RadioFrequency, x);
        if x.is_nan() {
            prop_assert_eq!(wrote, 0);
        } else {
            let (_, value) = TlvReader::new(&buf).next().unwrap();
            prop_assert_eq!(decode_double(value).to_bits(), x.to_bits());
        }
    }

    #[test]
    fn prop_string_round_trip(s in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut buf = Vec::new();
        encode_string(&mut buf, Tag::Description, &s);
        let (_, value) = TlvReader::new(&buf).next().unwrap();
        prop_assert_eq!(value, &s[..]);
    }

    /// The walker must terminate on any byte soup, including adversarial
    /// length fields and a missing EOL, and never yield a record whose
    /// value runs past the buffer.
    #[test]
    fn prop_walker_terminates_and_stays_in_bounds(
        body in proptest::collection::vec(any::<u8>(), 0..2048)
    ) {
        let mut records = 0usize;
        for (_, value) in TlvReader::new(&body) {
            records += 1;
            prop_assert!(value.len() <= body.len());
        }
        // Each record consumes at least two bytes of input
        prop_assert!(records <= body.len() / 2 + 1);
    }

    /// Garbage after a well-formed prefix never corrupts the prefix.
    #[test]
    fn prop_prefix_decodes_despite_trailing_garbage(
        x in any::<u64>(),
        garbage in proptest::collection::vec(any::<u8>(), 0..64)
    ) {
        let mut buf = Vec::new();
        encode_int64(&mut buf, Tag::GpsTime, x);
        encode_eol(&mut buf);
        buf.extend_from_slice(&garbage);
        let mut reader = TlvReader::new(&buf);
        let (tag, value) = reader.next().unwrap();
        prop_assert_eq!(tag, Tag::GpsTime);
        prop_assert_eq!(decode_int(value), x);
        prop_assert!(reader.next().is_none()); // EOL stops the scan
    }
}

#[test]
fn scenario_zero_suppression() {
    // Any integer tag with value 0 is exactly two bytes on the wire
    let mut buf = Vec::new();
    let n = encode_int64(&mut buf, Tag::CommandCount, 0);
    assert_eq!((n, buf.len()), (2, 2));
}

#[test]
fn scenario_long_string_wire_bytes() {
    // A 300-byte string: tag | 0x82 | 0x01 0x2C | payload
    let payload = vec![0x55u8; 300];
    let mut buf = Vec::new();
    encode_string(&mut buf, Tag::Description, &payload);
    assert_eq!(buf[0], Tag::Description as u8);
    assert_eq!(&buf[1..4], &[0x82, 0x01, 0x2c]);
    assert_eq!(buf.len(), 4 + 300);
}

#[test]
fn scenario_full_packet_round_trip() {
    let mut buf = Vec::new();
    buf.push(tlv::PKT_RESPONSE);
    tlv::encode_int32(&mut buf, Tag::CommandTag, 0x1234_5678);
    tlv::encode_int64(&mut buf, Tag::CommandCount, 0);
    tlv::encode_int64(&mut buf, Tag::GpsTime, 0x0123_4567_89ab_cdef);
    tlv::encode_string(&mut buf, Tag::Description, b"rx");
    tlv::encode_eol(&mut buf);

    let fields: Vec<(Tag, u64)> = TlvReader::new(&buf[1..])
        .map(|(tag, value)| (tag, decode_int(value)))
        .collect();
    assert_eq!(
        fields,
        vec![
            (Tag::CommandTag, 0x1234_5678),
            (Tag::CommandCount, 0),
            (Tag::GpsTime, 0x0123_4567_89ab_cdef),
            (Tag::Description, u64::from_be_bytes([0, 0, 0, 0, 0, 0, b'r', b'x'])),
        ]
    );
}
