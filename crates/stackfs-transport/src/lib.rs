#![warn(missing_docs)]

//! stackfs transport layer: framed wire protocol, epoll event pool, socket and RDMA transports
//!
//! Every connection exchanges frames made of a 12-byte header, an opaque
//! header blob and an optional payload. Transports are driven by a shared
//! [`EventPool`] and report connection and readiness events through a
//! [`Notify`] target; the socket carrier runs over TCP or Unix-domain
//! sockets, the RDMA carrier over verbs queue pairs set up through a TCP
//! control connection.

pub mod config;
pub mod error;
pub mod event;
pub mod incoming;
pub mod ioq;
pub mod metrics;
pub mod name;
pub mod protocol;
pub mod rdma;
pub mod rdma_device;
pub mod rdma_handshake;
pub mod rdma_sim;
pub mod socket;
pub mod transport;

pub use config::{
    AddressFamily, PathMtu, RdmaOptions, SocketOptions, TransportConfig, TransportKind,
};
pub use error::{Result, TransportError};
pub use event::{EventHandler, EventPool, EventPoolConfig, Readiness, SlotId};
pub use incoming::{Assembler, IncomingState, Pump};
pub use ioq::{BufferRef, IoqEntry, OutboundQueue};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use name::{Endpoint, PeerInfo};
pub use protocol::{
    decode_frame, encode_frame, FrameHeader, ReceivedFrame, FRAME_HEADER_SIZE, MAGIC,
    MAX_HEADER_BLOB_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
pub use rdma::RdmaTransport;
pub use rdma_device::{RdmaContext, RdmaDevice};
pub use socket::SocketTransport;
pub use transport::{
    init, ConnectionState, Notification, Notify, NotifyFn, Transport, TransportContext,
    TransportEvent,
};
