//! Per-connection outbound queue.
//!
//! Entries are written strictly in submission order. The head entry is the
//! only one ever being written; a partial write leaves its cursor where the
//! carrier stopped and the rest of the queue waits behind it.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice, Write};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::protocol::{FrameHeader, FRAME_HEADER_SIZE};

/// Shared buffer kept alive until the entry referencing it is flushed or discarded.
pub type BufferRef = Arc<dyn Any + Send + Sync>;

/// One queued frame write.
pub struct IoqEntry {
    header: [u8; FRAME_HEADER_SIZE],
    blob: Bytes,
    payload: Vec<Bytes>,
    cursor: usize,
    total: usize,
    _refs: Option<BufferRef>,
}

impl fmt::Debug for IoqEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoqEntry")
            .field("blob_len", &self.blob.len())
            .field("payload_chunks", &self.payload.len())
            .field("cursor", &self.cursor)
            .field("total", &self.total)
            .finish()
    }
}

impl IoqEntry {
    /// Builds the wire frame for `blob` and `payload`. Fails if the sizes are
    /// outside what a peer accepts.
    pub fn new(blob: Bytes, payload: Vec<Bytes>, refs: Option<BufferRef>) -> Result<Self> {
        let payload_len: usize = payload.iter().map(Bytes::len).sum();
        let fh = FrameHeader::new(blob.len(), payload_len)?;
        Ok(Self {
            header: fh.encode(),
            total: fh.frame_len(),
            blob,
            payload: payload.into_iter().filter(|p| !p.is_empty()).collect(),
            cursor: 0,
            _refs: refs,
        })
    }

    /// Full frame length.
    pub fn len(&self) -> usize {
        self.total
    }

    /// Bytes not written yet.
    pub fn remaining(&self) -> usize {
        self.total - self.cursor
    }

    /// True once every byte has been written.
    pub fn is_done(&self) -> bool {
        self.cursor == self.total
    }

    fn parts(&self) -> impl Iterator<Item = &[u8]> {
        std::iter::once(&self.header[..])
            .chain(std::iter::once(&self.blob[..]))
            .chain(self.payload.iter().map(|p| &p[..]))
    }

    /// I/O vector over the unsent remainder.
    fn pending(&self) -> Vec<IoSlice<'_>> {
        let mut skip = self.cursor;
        let mut out = Vec::with_capacity(2 + self.payload.len());
        for part in self.parts() {
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            out.push(IoSlice::new(&part[skip..]));
            skip = 0;
        }
        out
    }

    /// Writes as much of the remainder as `w` accepts.
    ///
    /// Returns the number of bytes written by this call. `WouldBlock` stops
    /// the loop without error; a zero-length write is reported as `WriteZero`.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        let mut written = 0;
        while !self.is_done() {
            let result = {
                let slices = self.pending();
                w.write_vectored(&slices)
            };
            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.cursor += n;
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Flattens the whole frame into one buffer, for carriers that send
    /// message-at-a-time from a registered region.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total);
        for part in self.parts() {
            buf.put_slice(part);
        }
        buf.freeze()
    }
}

/// State of the queue after a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing left to write.
    Empty,
    /// Entries are waiting for the carrier to become writable.
    Pending,
}

/// Result of [`OutboundQueue::submit`] or [`OutboundQueue::churn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes handed to the carrier by this call.
    pub written: usize,
    /// Queue state afterwards.
    pub state: QueueState,
}

/// FIFO of frames waiting for the carrier.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<IoqEntry>,
}

impl OutboundQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued bytes not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.entries.iter().map(IoqEntry::remaining).sum()
    }

    fn state(&self) -> QueueState {
        if self.entries.is_empty() {
            QueueState::Empty
        } else {
            QueueState::Pending
        }
    }

    /// Writes `entry` immediately if nothing is queued ahead of it; otherwise,
    /// or if the write is partial, appends it behind the existing entries.
    pub fn submit<W: Write>(&mut self, mut entry: IoqEntry, w: &mut W) -> io::Result<Progress> {
        let mut written = 0;
        if self.entries.is_empty() {
            written = entry.write_to(w)?;
        }
        if !entry.is_done() {
            self.entries.push_back(entry);
        }
        Ok(Progress {
            written,
            state: self.state(),
        })
    }

    /// Drains queued entries in order until the queue is empty or the carrier
    /// would block. Fully written entries are dropped here.
    pub fn churn<W: Write>(&mut self, w: &mut W) -> io::Result<Progress> {
        let mut written = 0;
        while let Some(head) = self.entries.front_mut() {
            written += head.write_to(w)?;
            if !head.is_done() {
                break;
            }
            self.entries.pop_front();
        }
        Ok(Progress {
            written,
            state: self.state(),
        })
    }

    /// Appends an entry without attempting a write.
    pub fn push_back(&mut self, entry: IoqEntry) {
        self.entries.push_back(entry);
    }

    /// Removes the head entry.
    pub fn pop_front(&mut self) -> Option<IoqEntry> {
        self.entries.pop_front()
    }

    /// Discards every queued entry without sending it. Returns how many were dropped.
    pub fn flush(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }
}
