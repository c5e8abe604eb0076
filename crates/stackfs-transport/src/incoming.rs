//! Receive-side frame assembly for stream transports.
//!
//! [`IncomingState`] is a pure state machine: [`IncomingState::step`] takes
//! the current state plus whatever bytes are available and returns the next
//! state together with how many bytes it consumed. [`Assembler`] wraps it
//! for socket use, reading straight into the pending buffers.

use std::io::{self, IoSliceMut, Read};

use bytes::Bytes;
use tracing::{debug, error, trace};

use crate::error::{Result, TransportError};
use crate::protocol::{FrameHeader, ReceivedFrame, FRAME_HEADER_SIZE};

/// Per-connection receive state.
#[derive(Debug, Default)]
pub enum IncomingState {
    /// Nothing armed yet.
    #[default]
    Nada,
    /// Reading the fixed frame header.
    HeaderComing {
        /// Header bytes received so far.
        buf: [u8; FRAME_HEADER_SIZE],
        /// Number of valid bytes in `buf`.
        filled: usize,
    },
    /// A full header has arrived but is not validated yet.
    HeaderCame {
        /// Raw header bytes.
        raw: [u8; FRAME_HEADER_SIZE],
    },
    /// Reading the header blob and payload.
    DataComing {
        /// Header blob buffer, sized from the validated header.
        blob: Vec<u8>,
        /// Payload buffer, sized from the validated header.
        payload: Vec<u8>,
        /// Bytes received across both buffers.
        filled: usize,
    },
    /// Blob and payload fully received.
    DataCame {
        /// Header blob.
        blob: Vec<u8>,
        /// Payload.
        payload: Vec<u8>,
    },
    /// Frame is waiting for the caller to take it.
    Complete(ReceivedFrame),
}

impl IncomingState {
    /// Short state name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            IncomingState::Nada => "NADA",
            IncomingState::HeaderComing { .. } => "HEADER_COMING",
            IncomingState::HeaderCame { .. } => "HEADER_CAME",
            IncomingState::DataComing { .. } => "DATA_COMING",
            IncomingState::DataCame { .. } => "DATA_CAME",
            IncomingState::Complete(_) => "COMPLETE",
        }
    }

    /// True while the state is waiting on bytes from the carrier.
    pub fn wants_input(&self) -> bool {
        matches!(
            self,
            IncomingState::HeaderComing { .. } | IncomingState::DataComing { .. }
        )
    }

    /// Bytes still required to leave the current reading state.
    pub fn remaining(&self) -> usize {
        match self {
            IncomingState::HeaderComing { filled, .. } => FRAME_HEADER_SIZE - filled,
            IncomingState::DataComing {
                blob,
                payload,
                filled,
            } => blob.len() + payload.len() - filled,
            _ => 0,
        }
    }

    /// Advances the machine by one transition.
    ///
    /// Reading states consume up to [`remaining`](Self::remaining) bytes of
    /// `input`; a short input leaves the state unchanged apart from its fill
    /// count. Other states consume nothing. `Complete` is a fixed point until
    /// the frame is taken.
    pub fn step(self, input: &[u8]) -> Result<(IncomingState, usize)> {
        match self {
            IncomingState::Nada => Ok((
                IncomingState::HeaderComing {
                    buf: [0u8; FRAME_HEADER_SIZE],
                    filled: 0,
                },
                0,
            )),
            IncomingState::HeaderComing { mut buf, filled } => {
                let n = input.len().min(FRAME_HEADER_SIZE - filled);
                buf[filled..filled + n].copy_from_slice(&input[..n]);
                let next = IncomingState::HeaderComing {
                    buf,
                    filled: filled + n,
                };
                Ok((next.settle(), n))
            }
            IncomingState::HeaderCame { raw } => {
                let header = FrameHeader::decode(&raw)?;
                Ok((
                    IncomingState::DataComing {
                        blob: vec![0u8; header.header_len as usize],
                        payload: vec![0u8; header.payload_len as usize],
                        filled: 0,
                    },
                    0,
                ))
            }
            IncomingState::DataComing {
                mut blob,
                mut payload,
                filled,
            } => {
                let mut used = 0;
                let mut at = filled;
                if at < blob.len() {
                    let n = input.len().min(blob.len() - at);
                    blob[at..at + n].copy_from_slice(&input[..n]);
                    used += n;
                    at += n;
                }
                if at >= blob.len() {
                    let off = at - blob.len();
                    let n = (input.len() - used).min(payload.len() - off);
                    payload[off..off + n].copy_from_slice(&input[used..used + n]);
                    used += n;
                    at += n;
                }
                let next = IncomingState::DataComing {
                    blob,
                    payload,
                    filled: at,
                };
                Ok((next.settle(), used))
            }
            IncomingState::DataCame { blob, payload } => Ok((
                IncomingState::Complete(ReceivedFrame {
                    header: Bytes::from(blob),
                    payload: Bytes::from(payload),
                }),
                0,
            )),
            complete @ IncomingState::Complete(_) => Ok((complete, 0)),
        }
    }

    /// Moves a reading state whose buffers are full to its "came" successor.
    fn settle(self) -> IncomingState {
        match self {
            IncomingState::HeaderComing { buf, filled } if filled == FRAME_HEADER_SIZE => {
                IncomingState::HeaderCame { raw: buf }
            }
            IncomingState::DataComing {
                blob,
                payload,
                filled,
            } if filled == blob.len() + payload.len() => IncomingState::DataCame { blob, payload },
            other => other,
        }
    }

    /// Feeds bytes through the machine until they are used up or a frame is
    /// complete. Returns the number of bytes consumed.
    pub fn feed(&mut self, mut input: &[u8]) -> Result<usize> {
        let mut consumed = 0;
        loop {
            if matches!(self, IncomingState::Complete(_)) {
                return Ok(consumed);
            }
            if self.wants_input() && input.is_empty() {
                return Ok(consumed);
            }
            let (next, used) = std::mem::take(self).step(input)?;
            *self = next;
            consumed += used;
            input = &input[used..];
        }
    }

    /// Mutable views of the unfilled parts of the pending buffers.
    fn pending_slices(&mut self) -> Vec<IoSliceMut<'_>> {
        match self {
            IncomingState::HeaderComing { buf, filled } => {
                vec![IoSliceMut::new(&mut buf[*filled..])]
            }
            IncomingState::DataComing {
                blob,
                payload,
                filled,
            } => {
                let mut slices = Vec::with_capacity(2);
                if *filled < blob.len() {
                    slices.push(IoSliceMut::new(&mut blob[*filled..]));
                    slices.push(IoSliceMut::new(&mut payload[..]));
                } else {
                    let off = *filled - blob.len();
                    slices.push(IoSliceMut::new(&mut payload[off..]));
                }
                slices.retain(|s| !s.is_empty());
                slices
            }
            _ => Vec::new(),
        }
    }

    fn commit(self, n: usize) -> IncomingState {
        match self {
            IncomingState::HeaderComing { buf, filled } => IncomingState::HeaderComing {
                buf,
                filled: filled + n,
            }
            .settle(),
            IncomingState::DataComing {
                blob,
                payload,
                filled,
            } => IncomingState::DataComing {
                blob,
                payload,
                filled: filled + n,
            }
            .settle(),
            other => other,
        }
    }
}

/// Outcome of one [`Assembler::pump`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// A whole frame is waiting in the assembler.
    Complete,
    /// The reader has no more bytes right now.
    WouldBlock,
}

/// Drives an [`IncomingState`] from a byte stream.
#[derive(Debug, Default)]
pub struct Assembler {
    state: IncomingState,
    bytes_read: u64,
}

impl Assembler {
    /// Creates an assembler in the `Nada` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> &IncomingState {
        &self.state
    }

    /// True if a complete frame is waiting to be taken.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, IncomingState::Complete(_))
    }

    /// Total bytes read from the carrier so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Runs the state machine against `reader` until a frame completes or the
    /// reader would block.
    ///
    /// End of stream and hard read errors are reported as errors. The state
    /// must change on every loop iteration; a transition that fails to move
    /// is reported as [`TransportError::StateStalled`] instead of spinning.
    pub fn pump<R: Read>(&mut self, reader: &mut R) -> Result<Pump> {
        loop {
            let before = self.state.name();
            match self.state {
                IncomingState::Complete(_) => return Ok(Pump::Complete),
                IncomingState::HeaderComing { .. } | IncomingState::DataComing { .. } => {
                    if self.fill(reader)? == Pump::WouldBlock {
                        return Ok(Pump::WouldBlock);
                    }
                }
                _ => {
                    let state = std::mem::take(&mut self.state);
                    let (next, _) = state.step(&[]).map_err(|e| {
                        error!(error = %e, "invalid frame header from peer");
                        e
                    })?;
                    self.state = next;
                }
            }
            if self.state.name() == before {
                error!(state = before, "receive state machine did not advance");
                return Err(TransportError::StateStalled { state: before });
            }
        }
    }

    /// Reads into the pending buffers until they are full or the reader would block.
    fn fill<R: Read>(&mut self, reader: &mut R) -> Result<Pump> {
        while self.state.wants_input() {
            let result = {
                let mut slices = self.state.pending_slices();
                reader.read_vectored(&mut slices)
            };
            match result {
                Ok(0) => {
                    debug!(state = self.state.name(), "EOF from peer");
                    return Err(TransportError::ConnectionClosed);
                }
                Ok(n) => {
                    self.bytes_read += n as u64;
                    let state = std::mem::take(&mut self.state);
                    self.state = state.commit(n);
                    if self.state.wants_input() {
                        trace!(read = n, remaining = self.state.remaining(), "partial read");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Pump::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "read failed");
                    return Err(e.into());
                }
            }
        }
        Ok(Pump::Complete)
    }

    /// Takes the completed frame, resetting the machine to `Nada`.
    pub fn take(&mut self) -> Option<ReceivedFrame> {
        match std::mem::take(&mut self.state) {
            IncomingState::Complete(frame) => Some(frame),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Drops any partially assembled frame.
    pub fn reset(&mut self) {
        self.state = IncomingState::Nada;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;
    use std::collections::VecDeque;

    /// Reader handing out queued chunks, then WouldBlock.
    struct ChunkReader {
        chunks: VecDeque<Vec<u8>>,
        eof: bool,
    }

    impl Read for ChunkReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.front_mut() {
                Some(chunk) => {
                    let n = buf.len().min(chunk.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.chunks.pop_front();
                    }
                    Ok(n)
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn test_step_sequence() {
        let frame = encode_frame(b"PING", &[b"xy"]).unwrap();
        let (s, used) = IncomingState::Nada.step(&frame).unwrap();
        assert_eq!(s.name(), "HEADER_COMING");
        assert_eq!(used, 0);
        let (s, used) = s.step(&frame).unwrap();
        assert_eq!(s.name(), "HEADER_CAME");
        assert_eq!(used, 12);
        let (s, _) = s.step(&[]).unwrap();
        assert_eq!(s.name(), "DATA_COMING");
        assert_eq!(s.remaining(), 6);
        let (s, used) = s.step(&frame[12..]).unwrap();
        assert_eq!(s.name(), "DATA_CAME");
        assert_eq!(used, 6);
        let (s, _) = s.step(&[]).unwrap();
        match s {
            IncomingState::Complete(f) => {
                assert_eq!(&f.header[..], b"PING");
                assert_eq!(&f.payload[..], b"xy");
            }
            other => panic!("unexpected state {}", other.name()),
        }
    }

    #[test]
    fn test_partial_header_keeps_state() {
        let frame = encode_frame(b"PING", &[]).unwrap();
        let (s, _) = IncomingState::Nada.step(&[]).unwrap();
        let (s, used) = s.step(&frame[..5]).unwrap();
        assert_eq!(used, 5);
        assert_eq!(s.name(), "HEADER_COMING");
        assert_eq!(s.remaining(), 7);
    }

    #[test]
    fn test_invalid_header_fails_in_header_came() {
        let mut frame = encode_frame(b"PING", &[]).unwrap().to_vec();
        frame[11] = 7;
        let mut state = IncomingState::Nada;
        let err = state.feed(&frame).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_feed_byte_at_a_time() {
        let frame = encode_frame(b"hello", &[b"world"]).unwrap();
        let mut state = IncomingState::Nada;
        for b in frame.iter() {
            state.feed(std::slice::from_ref(b)).unwrap();
        }
        match state {
            IncomingState::Complete(f) => {
                assert_eq!(&f.header[..], b"hello");
                assert_eq!(&f.payload[..], b"world");
            }
            other => panic!("unexpected state {}", other.name()),
        }
    }

    #[test]
    fn test_feed_stops_at_frame_boundary() {
        let mut bytes = encode_frame(b"one", &[]).unwrap().to_vec();
        bytes.extend_from_slice(&encode_frame(b"two", &[]).unwrap());
        let mut state = IncomingState::Nada;
        let used = state.feed(&bytes).unwrap();
        assert_eq!(used, 15);
        assert_eq!(state.name(), "COMPLETE");
    }

    #[test]
    fn test_pump_partial_then_complete() {
        let frame = encode_frame(b"PONG", &[b"data"]).unwrap();
        let mut reader = ChunkReader {
            chunks: VecDeque::from(vec![frame[..7].to_vec()]),
            eof: false,
        };
        let mut asm = Assembler::new();
        assert_eq!(asm.pump(&mut reader).unwrap(), Pump::WouldBlock);
        assert_eq!(asm.state().name(), "HEADER_COMING");

        reader.chunks.push_back(frame[7..].to_vec());
        assert_eq!(asm.pump(&mut reader).unwrap(), Pump::Complete);
        // Repeated pumps before consumption are no-ops.
        assert_eq!(asm.pump(&mut reader).unwrap(), Pump::Complete);
        assert_eq!(asm.bytes_read(), frame.len() as u64);

        let f = asm.take().unwrap();
        assert_eq!(&f.header[..], b"PONG");
        assert_eq!(&f.payload[..], b"data");
        assert_eq!(asm.state().name(), "NADA");
        assert!(asm.take().is_none());
    }

    #[test]
    fn test_pump_eof_is_connection_closed() {
        let frame = encode_frame(b"PING", &[]).unwrap();
        let mut reader = ChunkReader {
            chunks: VecDeque::from(vec![frame[..3].to_vec()]),
            eof: true,
        };
        let mut asm = Assembler::new();
        assert!(matches!(
            asm.pump(&mut reader),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_pump_empty_payload() {
        let frame = encode_frame(b"PING", &[]).unwrap();
        let mut reader = ChunkReader {
            chunks: VecDeque::from(vec![frame.to_vec()]),
            eof: false,
        };
        let mut asm = Assembler::new();
        assert_eq!(asm.pump(&mut reader).unwrap(), Pump::Complete);
        let f = asm.take().unwrap();
        assert_eq!(&f.header[..], b"PING");
        assert!(f.payload.is_empty());
    }
}
