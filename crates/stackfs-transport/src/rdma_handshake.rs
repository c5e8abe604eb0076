//! Queue-pair handshake over the TCP control connection.
//!
//! Each side sends one fixed-size text block naming its block sizes and
//! queue pair, moves its queue pair to RTS once the peer's block has arrived,
//! and then sends a short acknowledgement. The connection is up when the
//! local acknowledgement has been written and the peer's has been read.
//!
//! ```text
//! QP1:RECV_BLKSIZE=00100000:SEND_BLKSIZE=00100000\n
//! QP1:LID=0011:QPN=000002:PSN=5a1c3e\n
//! \0
//! ```

use std::io::{self, Read, Write};

use crate::error::{Result, TransportError};

/// Length of the block exchanged first, including the trailing NUL.
pub const HANDSHAKE_DATA_LEN: usize = 84;

/// Acknowledgement sent once the local queue pair is ready.
pub const HANDSHAKE_ACK: &[u8; 6] = b"DONE\n\0";

const QPN_MASK: u32 = 0x00ff_ffff;

/// One side's connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeData {
    /// Largest message this side can receive.
    pub recv_blksize: u32,
    /// Largest message this side will send.
    pub send_blksize: u32,
    /// Local identifier of the port.
    pub lid: u16,
    /// Queue pair number, 24 bits.
    pub qpn: u32,
    /// Initial packet sequence number, 24 bits.
    pub psn: u32,
}

impl HandshakeData {
    /// Text block sent to the peer.
    pub fn encode(&self) -> [u8; HANDSHAKE_DATA_LEN] {
        let text = format!(
            "QP1:RECV_BLKSIZE={:08x}:SEND_BLKSIZE={:08x}\nQP1:LID={:04x}:QPN={:06x}:PSN={:06x}\n",
            self.recv_blksize,
            self.send_blksize,
            self.lid,
            self.qpn & QPN_MASK,
            self.psn & QPN_MASK,
        );
        let mut out = [0u8; HANDSHAKE_DATA_LEN];
        out[..text.len()].copy_from_slice(text.as_bytes());
        out
    }

    /// Parses the peer's block; trailing NUL padding is ignored.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if !buf.starts_with(b"QP1:") {
            return Err(handshake_err(
                "peer did not send QP1 data, possibly a different transport type",
            ));
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let text = std::str::from_utf8(&buf[..end])
            .map_err(|_| handshake_err("handshake data is not text"))?;
        let mut lines = text.lines();
        let sizes = lines
            .next()
            .and_then(|l| l.strip_prefix("QP1:RECV_BLKSIZE="))
            .ok_or_else(|| handshake_err("missing block sizes"))?;
        let (recv, send) = sizes
            .split_once(":SEND_BLKSIZE=")
            .ok_or_else(|| handshake_err("missing send block size"))?;
        let qp = lines
            .next()
            .and_then(|l| l.strip_prefix("QP1:LID="))
            .ok_or_else(|| handshake_err("missing queue pair data"))?;
        let (lid, rest) = qp
            .split_once(":QPN=")
            .ok_or_else(|| handshake_err("missing QPN"))?;
        let (qpn, psn) = rest
            .split_once(":PSN=")
            .ok_or_else(|| handshake_err("missing PSN"))?;
        Ok(Self {
            recv_blksize: hex(recv)?,
            send_blksize: hex(send)?,
            lid: u16::try_from(hex(lid)?).map_err(|_| handshake_err("LID out of range"))?,
            qpn: hex(qpn)? & QPN_MASK,
            psn: hex(psn)? & QPN_MASK,
        })
    }
}

fn hex(field: &str) -> Result<u32> {
    u32::from_str_radix(field, 16).map_err(|_| handshake_err(&format!("bad hex field {field:?}")))
}

fn handshake_err(reason: &str) -> TransportError {
    TransportError::Handshake {
        reason: reason.to_string(),
    }
}

/// Block sizes for a connection as `(send, recv)`: each side sends no more
/// than the other can receive.
pub fn negotiate(local_send: u32, local_recv: u32, remote: &HandshakeData) -> (u32, u32) {
    (
        local_send.min(remote.recv_blksize),
        local_recv.min(remote.send_blksize),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outgoing {
    Data { sent: usize },
    /// Data written, waiting for the local queue pair.
    AwaitingQp,
    Ack { sent: usize },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Incoming {
    Data,
    Ack,
    Done,
}

/// Progress of one handshake.
#[derive(Debug)]
pub struct Handshake {
    local: [u8; HANDSHAKE_DATA_LEN],
    out: Outgoing,
    inc: Incoming,
    buf: Vec<u8>,
    qp_ready: bool,
}

impl Handshake {
    /// Starts a handshake that will announce `local`.
    pub fn new(local: &HandshakeData) -> Self {
        Self {
            local: local.encode(),
            out: Outgoing::Data { sent: 0 },
            inc: Incoming::Data,
            buf: Vec::with_capacity(HANDSHAKE_DATA_LEN),
            qp_ready: false,
        }
    }

    /// Whether there is something to write right now.
    pub fn wants_write(&self) -> bool {
        matches!(self.out, Outgoing::Data { .. } | Outgoing::Ack { .. })
    }

    /// Both acknowledgements have gone through.
    pub fn is_complete(&self) -> bool {
        self.out == Outgoing::Done && self.inc == Incoming::Done
    }

    /// Marks the local queue pair as connected, allowing the acknowledgement.
    pub fn qp_ready(&mut self) {
        self.qp_ready = true;
        if self.out == Outgoing::AwaitingQp {
            self.out = Outgoing::Ack { sent: 0 };
        }
    }

    /// Writes as much pending handshake output as `w` accepts.
    pub fn on_writable<W: Write>(&mut self, w: &mut W) -> Result<()> {
        loop {
            let (bytes, sent): (&[u8], usize) = match self.out {
                Outgoing::Data { sent } => (&self.local, sent),
                Outgoing::Ack { sent } => (HANDSHAKE_ACK, sent),
                Outgoing::AwaitingQp | Outgoing::Done => return Ok(()),
            };
            let n = match w.write(&bytes[sent..]) {
                Ok(0) => return Err(TransportError::ConnectionClosed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let total = sent + n;
            let len = bytes.len();
            self.out = match self.out {
                Outgoing::Data { .. } if total < len => Outgoing::Data { sent: total },
                Outgoing::Data { .. } if self.qp_ready => Outgoing::Ack { sent: 0 },
                Outgoing::Data { .. } => Outgoing::AwaitingQp,
                Outgoing::Ack { .. } if total < len => Outgoing::Ack { sent: total },
                _ => Outgoing::Done,
            };
        }
    }

    /// Reads handshake input. Returns the peer's data once, when its block
    /// has fully arrived; the caller connects its queue pair and then calls
    /// [`Handshake::qp_ready`].
    pub fn on_readable<R: Read>(&mut self, r: &mut R) -> Result<Option<HandshakeData>> {
        loop {
            let need = match self.inc {
                Incoming::Data => HANDSHAKE_DATA_LEN,
                Incoming::Ack => HANDSHAKE_ACK.len(),
                Incoming::Done => return Ok(None),
            };
            let filled = self.buf.len();
            self.buf.resize(need, 0);
            let n = match r.read(&mut self.buf[filled..]) {
                Ok(0) => {
                    self.buf.truncate(filled);
                    return Err(TransportError::ConnectionClosed);
                }
                Ok(n) => n,
                Err(e) => {
                    self.buf.truncate(filled);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return Ok(None),
                        io::ErrorKind::Interrupted => continue,
                        _ => return Err(e.into()),
                    }
                }
            };
            self.buf.truncate(filled + n);
            if self.buf.len() < need {
                continue;
            }
            match self.inc {
                Incoming::Data => {
                    let remote = HandshakeData::parse(&self.buf)?;
                    self.buf.clear();
                    self.inc = Incoming::Ack;
                    return Ok(Some(remote));
                }
                Incoming::Ack => {
                    if self.buf.as_slice() != HANDSHAKE_ACK {
                        return Err(handshake_err("bad acknowledgement"));
                    }
                    self.buf.clear();
                    self.inc = Incoming::Done;
                }
                Incoming::Done => {}
            }
        }
    }
}
