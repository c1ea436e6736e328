//! Property-based tests for frame parsing, reassembly and handshake parsing.
//!
//! These tests use proptest to fuzz the parsers with server-shaped input.

use proptest::prelude::*;
use wstether::protocol::{Assembled, Frame, FrameSequence, HandshakeRequest, HandshakeResponse, OpCode, apply_mask};
use wstether::{CloseFrame, Limits};

fn any_opcode_strategy() -> impl Strategy<Value = OpCode> {
    prop_oneof![
        Just(OpCode::Continuation),
        Just(OpCode::Text),
        Just(OpCode::Binary),
        Just(OpCode::Close),
        Just(OpCode::Ping),
        Just(OpCode::Pong),
    ]
}

/// Split `len` bytes into chunk lengths using `cuts` as relative cut points.
fn chunk_lengths(len: usize, cuts: &[usize]) -> Vec<usize> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (len + 1)).collect();
    points.push(0);
    points.push(len);
    points.sort_unstable();
    points.dedup();
    let mut lengths: Vec<usize> = points.windows(2).map(|w| w[1] - w[0]).collect();
    if lengths.is_empty() {
        lengths.push(0);
    }
    lengths
}

proptest! {
    // =========================================================================
    // Parsers never panic on arbitrary server bytes
    // =========================================================================
    #[test]
    fn test_frame_parse_no_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Frame::parse(&data);
    }

    #[test]
    fn test_close_payload_parse_no_panic(data in prop::collection::vec(any::<u8>(), 0..130)) {
        let parsed = CloseFrame::parse(&data);
        prop_assert_eq!(parsed.is_none(), data.is_empty());
        if data.len() >= 2 && std::str::from_utf8(&data[2..]).is_ok() {
            let close = parsed.unwrap();
            prop_assert_eq!(close.code.as_u16(), u16::from_be_bytes([data[0], data[1]]));
        }
    }

    #[test]
    fn test_handshake_response_no_panic(data in prop::collection::vec(any::<u8>(), 0..2000)) {
        let request = HandshakeRequest::new("example.com", "/");
        let _ = HandshakeResponse::parse(&data, &request);
    }

    // =========================================================================
    // Masking is its own inverse
    // =========================================================================
    #[test]
    fn test_mask_reversible(
        data in prop::collection::vec(any::<u8>(), 0..2000),
        mask in any::<[u8; 4]>()
    ) {
        let mut masked = data.clone();
        apply_mask(&mut masked, mask);
        apply_mask(&mut masked, mask);
        prop_assert_eq!(data, masked);
    }

    // =========================================================================
    // Wire size calculation matches actual written bytes
    // =========================================================================
    #[test]
    fn test_wire_size_accuracy(
        fin in any::<bool>(),
        opcode in any_opcode_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..70000),
        masked in any::<bool>()
    ) {
        let frame = Frame::new(fin, opcode, payload);
        let mask = if masked { Some([0x12, 0x34, 0x56, 0x78]) } else { None };
        let encoded = frame.encode(mask);
        prop_assert_eq!(frame.wire_size(masked), encoded.len());
    }

    // =========================================================================
    // Truncated frames are never accepted
    // =========================================================================
    #[test]
    fn test_truncated_frame_rejected(
        payload in prop::collection::vec(any::<u8>(), 1..500),
        truncate_by in 1..50usize
    ) {
        let encoded = Frame::binary(payload).encode(None);
        let truncated_len = encoded.len().saturating_sub(truncate_by).max(1);
        prop_assert!(Frame::parse(&encoded[..truncated_len]).is_err());
    }

    // =========================================================================
    // Any fragmentation of a message reassembles to the original
    // =========================================================================
    #[test]
    fn test_fragmented_binary_reassembles(
        payload in prop::collection::vec(any::<u8>(), 0..4000),
        cuts in prop::collection::vec(any::<usize>(), 0..8)
    ) {
        let mut sequence = FrameSequence::new(Limits::default());
        let lengths = chunk_lengths(payload.len(), &cuts);
        let mut offset = 0;
        let mut assembled = None;

        for (i, len) in lengths.iter().enumerate() {
            let opcode = if i == 0 { OpCode::Binary } else { OpCode::Continuation };
            let fin = i + 1 == lengths.len();
            let chunk = payload[offset..offset + len].to_vec();
            offset += len;

            let result = sequence.push(Frame::new(fin, opcode, chunk));
            prop_assert!(result.is_ok(), "push failed: {:?}", result);
            if fin {
                assembled = result.unwrap();
            } else {
                prop_assert!(result.unwrap().is_none());
                prop_assert!(sequence.is_open());
            }
        }

        prop_assert_eq!(assembled, Some(Assembled::Binary(payload)));
        prop_assert!(!sequence.is_open());
    }

    #[test]
    fn test_fragmented_text_splits_inside_code_points(
        text in "\\PC{0,200}",
        cuts in prop::collection::vec(any::<usize>(), 0..6)
    ) {
        let bytes = text.as_bytes();
        let mut sequence = FrameSequence::new(Limits::default());
        let lengths = chunk_lengths(bytes.len(), &cuts);
        let mut offset = 0;
        let mut assembled = None;

        for (i, len) in lengths.iter().enumerate() {
            let opcode = if i == 0 { OpCode::Text } else { OpCode::Continuation };
            let fin = i + 1 == lengths.len();
            let chunk = bytes[offset..offset + len].to_vec();
            offset += len;
            let result = sequence.push(Frame::new(fin, opcode, chunk));
            prop_assert!(result.is_ok(), "push failed: {:?}", result);
            if fin {
                assembled = result.unwrap();
            }
        }

        prop_assert_eq!(assembled, Some(Assembled::Text(text)));
    }

    // =========================================================================
    // Control frames: at most 125 bytes
    // =========================================================================
    #[test]
    fn test_control_frame_size_limit(
        opcode in prop_oneof![Just(OpCode::Ping), Just(OpCode::Pong)],
        len in 0usize..256
    ) {
        let frame = Frame::new(true, opcode, vec![0; len]);
        prop_assert_eq!(frame.validate().is_ok(), len <= 125);
    }
}

#[cfg(test)]
mod targeted_tests {
    use super::*;

    /// Length encoding boundaries: 7-bit, 16-bit and 64-bit forms.
    #[test]
    fn test_length_encoding_boundaries() {
        for (len, header) in [(125, 2), (126, 4), (65535, 4), (65536, 10)] {
            let frame = Frame::binary(vec![0xAB; len]);
            let encoded = frame.encode(None);
            assert_eq!(encoded.len(), len + header, "len {len}");

            let (parsed, used) = Frame::parse(&encoded).unwrap();
            assert_eq!(used, encoded.len());
            assert_eq!(parsed.payload().len(), len);
        }
    }

    #[test]
    fn test_chunk_lengths_cover_input() {
        assert_eq!(chunk_lengths(0, &[]), vec![0]);
        assert_eq!(chunk_lengths(10, &[3, 3, 7]), vec![3, 4, 3]);
        assert_eq!(chunk_lengths(10, &[]).iter().sum::<usize>(), 10);
    }
}
