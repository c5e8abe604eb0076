//! Wire protocol framing shared by every transport.
//!
//! A frame is a fixed 12-byte header followed by a header blob and a payload:
//!
//! ```text
//! +-------+-------+-------+---------------+---------------+---------+
//! | ':'   | 'O'   | '\0'  | size1 (u32 BE)| size2 (u32 BE)| version |
//! +-------+-------+-------+---------------+---------------+---------+
//! | size1 bytes of header blob | size2 bytes of payload             |
//! ```
//!
//! The header blob is an encoded RPC call or reply owned by the layer above;
//! the payload carries raw data such as file contents.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Frame magic tag.
pub const MAGIC: [u8; 3] = *b":O\0";

/// Protocol version carried in the last header byte.
pub const PROTOCOL_VERSION: u8 = 42;

/// Frame header size in bytes (magic:3 + size1:4 + size2:4 + version:1).
pub const FRAME_HEADER_SIZE: usize = 12;

/// Largest accepted header blob.
pub const MAX_HEADER_BLOB_SIZE: u32 = 1_048_576;

/// Largest accepted payload.
pub const MAX_PAYLOAD_SIZE: u32 = 131_072;

/// Decoded fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the header blob (`size1`).
    pub header_len: u32,
    /// Length of the payload (`size2`).
    pub payload_len: u32,
}

impl FrameHeader {
    /// Builds a header for the given lengths, rejecting anything a peer would refuse.
    pub fn new(header_len: usize, payload_len: usize) -> Result<Self> {
        let header = Self {
            header_len: u32::try_from(header_len).unwrap_or(u32::MAX),
            payload_len: u32::try_from(payload_len).unwrap_or(u32::MAX),
        };
        header.validate()?;
        Ok(header)
    }

    /// Checks the size bounds.
    pub fn validate(&self) -> Result<()> {
        if self.header_len == 0 || self.header_len > MAX_HEADER_BLOB_SIZE {
            return Err(TransportError::InvalidHeaderSize {
                size: self.header_len,
                max_size: MAX_HEADER_BLOB_SIZE,
            });
        }
        if self.payload_len > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: self.payload_len,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }

    /// Serializes the header in network byte order.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..3].copy_from_slice(&MAGIC);
        buf[3..7].copy_from_slice(&self.header_len.to_be_bytes());
        buf[7..11].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[11] = PROTOCOL_VERSION;
        buf
    }

    /// Parses and validates a received header. Nothing is allocated from the
    /// advertised sizes until they have passed validation.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 3];
        magic.copy_from_slice(&buf[0..3]);
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        if buf[11] != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: buf[11],
            });
        }
        let header = Self {
            header_len: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
            payload_len: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
        };
        header.validate()?;
        Ok(header)
    }

    /// Total frame length including this header.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.header_len as usize + self.payload_len as usize
    }
}

/// A complete frame handed to the caller by `receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Header blob bytes.
    pub header: Bytes,
    /// Payload bytes, possibly empty.
    pub payload: Bytes,
}

/// Encodes a whole frame into one contiguous buffer.
pub fn encode_frame(header: &[u8], payload: &[&[u8]]) -> Result<Bytes> {
    let payload_len: usize = payload.iter().map(|p| p.len()).sum();
    let fh = FrameHeader::new(header.len(), payload_len)?;
    let mut buf = BytesMut::with_capacity(fh.frame_len());
    buf.extend_from_slice(&fh.encode());
    buf.extend_from_slice(header);
    for chunk in payload {
        buf.extend_from_slice(chunk);
    }
    Ok(buf.freeze())
}

/// Decodes one complete frame from the start of `buf`, returning it together
/// with the number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<(ReceivedFrame, usize)> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(TransportError::Truncated {
            needed: FRAME_HEADER_SIZE,
            available: buf.len(),
        });
    }
    let mut raw = [0u8; FRAME_HEADER_SIZE];
    raw.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
    let fh = FrameHeader::decode(&raw)?;
    let total = fh.frame_len();
    if buf.len() < total {
        return Err(TransportError::Truncated {
            needed: total,
            available: buf.len(),
        });
    }
    let blob_end = FRAME_HEADER_SIZE + fh.header_len as usize;
    let frame = ReceivedFrame {
        header: Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..blob_end]),
        payload: Bytes::copy_from_slice(&buf[blob_end..total]),
    };
    Ok((frame, total))
}
