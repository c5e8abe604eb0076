//! Property-based tests for the wire codec and receive assembly.

use std::collections::VecDeque;
use std::io::{self, Read};

use proptest::prelude::*;
use stackfs_transport::{
    decode_frame, encode_frame, Assembler, FrameHeader, IncomingState, Pump, ReceivedFrame,
    TransportError, FRAME_HEADER_SIZE, MAX_HEADER_BLOB_SIZE, MAX_PAYLOAD_SIZE,
};

/// Header blob plus payload split into up to four chunks.
fn any_frame() -> impl Strategy<Value = (Vec<u8>, Vec<Vec<u8>>)> {
    (
        proptest::collection::vec(any::<u8>(), 1..512),
        proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..2048), 0..4),
    )
}

/// Reader that hands out the stream in the given chunk sizes, then blocks.
struct Chunked {
    chunks: VecDeque<Vec<u8>>,
}

impl Chunked {
    fn new(stream: &[u8], cuts: &[usize]) -> Self {
        let mut chunks = VecDeque::new();
        let mut rest = stream;
        for &cut in cuts {
            if rest.is_empty() {
                break;
            }
            let n = cut.clamp(1, rest.len());
            chunks.push_back(rest[..n].to_vec());
            rest = &rest[n..];
        }
        if !rest.is_empty() {
            chunks.push_back(rest.to_vec());
        }
        Self { chunks }
    }
}

impl Read for Chunked {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

fn expected(header: &[u8], payload: &[Vec<u8>]) -> ReceivedFrame {
    ReceivedFrame {
        header: header.to_vec().into(),
        payload: payload.concat().into(),
    }
}

proptest! {
    #[test]
    fn test_encode_decode_roundtrip((header, payload) in any_frame()) {
        let parts: Vec<&[u8]> = payload.iter().map(Vec::as_slice).collect();
        let wire = encode_frame(&header, &parts).unwrap();
        let total: usize = payload.iter().map(Vec::len).sum();
        prop_assert_eq!(wire.len(), FRAME_HEADER_SIZE + header.len() + total);

        let (frame, used) = decode_frame(&wire).unwrap();
        prop_assert_eq!(used, wire.len());
        prop_assert_eq!(frame, expected(&header, &payload));
    }

    #[test]
    fn test_header_bounds(
        header_len in 0u32..=2 * MAX_HEADER_BLOB_SIZE,
        payload_len in 0u32..=2 * MAX_PAYLOAD_SIZE,
    ) {
        let fh = FrameHeader { header_len, payload_len };
        let ok = (1..=MAX_HEADER_BLOB_SIZE).contains(&header_len)
            && payload_len <= MAX_PAYLOAD_SIZE;
        prop_assert_eq!(fh.validate().is_ok(), ok);
        prop_assert_eq!(FrameHeader::decode(&fh.encode()).is_ok(), ok);
        if header_len == 0 || header_len > MAX_HEADER_BLOB_SIZE {
            let is_header_err =
                matches!(fh.validate(), Err(TransportError::InvalidHeaderSize { .. }));
            prop_assert!(is_header_err);
        }
    }

    #[test]
    fn test_corrupted_magic_or_version_rejected(
        byte in prop_oneof![0usize..3, Just(11usize)],
        flip in 1u8..=255,
    ) {
        let mut raw = FrameHeader { header_len: 4, payload_len: 0 }.encode();
        raw[byte] ^= flip;
        let err = FrameHeader::decode(&raw).unwrap_err();
        let right_kind = matches!(
            err,
            TransportError::InvalidMagic { .. } | TransportError::VersionMismatch { .. }
        );
        prop_assert!(right_kind);
    }

    #[test]
    fn test_truncated_frame_rejected(
        (header, payload) in any_frame(),
        cut in any::<prop::sample::Index>(),
    ) {
        let parts: Vec<&[u8]> = payload.iter().map(Vec::as_slice).collect();
        let wire = encode_frame(&header, &parts).unwrap();
        let short = cut.index(wire.len());
        let is_truncated =
            matches!(decode_frame(&wire[..short]), Err(TransportError::Truncated { .. }));
        prop_assert!(is_truncated);
    }

    /// Feeding a stream of frames with arbitrary chunk boundaries yields the
    /// same frames as decoding them whole.
    #[test]
    fn test_feed_independent_of_chunking(
        frames in proptest::collection::vec(any_frame(), 1..6),
        cuts in proptest::collection::vec(1usize..700, 0..64),
    ) {
        let mut stream = Vec::new();
        for (header, payload) in &frames {
            let parts: Vec<&[u8]> = payload.iter().map(Vec::as_slice).collect();
            stream.extend_from_slice(&encode_frame(header, &parts).unwrap());
        }

        let mut state = IncomingState::default();
        let mut got = Vec::new();
        let mut reader = Chunked::new(&stream, &cuts);
        while let Some(chunk) = reader.chunks.pop_front() {
            let mut input = chunk.as_slice();
            loop {
                let used = state.feed(input).unwrap();
                input = &input[used..];
                if matches!(state, IncomingState::Complete(_)) {
                    if let IncomingState::Complete(frame) = std::mem::take(&mut state) {
                        got.push(frame);
                    }
                    continue;
                }
                if input.is_empty() {
                    break;
                }
            }
        }
        let want: Vec<ReceivedFrame> = frames.iter().map(|(h, p)| expected(h, p)).collect();
        prop_assert_eq!(got, want);
    }

    #[test]
    fn test_assembler_pump_independent_of_chunking(
        (header, payload) in any_frame(),
        cuts in proptest::collection::vec(1usize..300, 0..32),
    ) {
        let parts: Vec<&[u8]> = payload.iter().map(Vec::as_slice).collect();
        let wire = encode_frame(&header, &parts).unwrap();
        let mut reader = Chunked::new(&wire, &cuts);
        let mut asm = Assembler::new();

        prop_assert_eq!(asm.pump(&mut reader).unwrap(), Pump::Complete);
        prop_assert_eq!(asm.bytes_read(), wire.len() as u64);
        prop_assert_eq!(asm.take(), Some(expected(&header, &payload)));
        prop_assert!(matches!(asm.state(), IncomingState::Nada));
    }
}
