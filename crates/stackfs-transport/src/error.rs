use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid magic: expected {expected:02X?}, got {got:02X?}")]
    InvalidMagic { expected: [u8; 3], got: [u8; 3] },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("invalid header blob size: {size} bytes (must be 1..={max_size})")]
    InvalidHeaderSize { size: u32, max_size: u32 },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    #[error("frame too large for transport buffer: {size} bytes (max {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("not connected")]
    NotConnected,

    #[error("transport already connected or listening")]
    AlreadyConnected,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("receive state machine stalled in state {state}")]
    StateStalled { state: &'static str },

    #[error("event slots exhausted (max {max_slots})")]
    SlotsExhausted { max_slots: usize },

    #[error("unknown event slot {index} (generation {generation})")]
    SlotNotFound { index: u32, generation: u32 },

    #[error("event pool has been shut down")]
    PoolShutdown,

    #[error("invalid value {value:?} for option {key}: {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },

    #[error("missing option {key}")]
    MissingOption { key: String },

    #[error("cannot resolve address {addr}: {reason}")]
    AddressResolution { addr: String, reason: String },

    #[error("RDMA handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("RDMA device {name:?} not found")]
    DeviceNotFound { name: String },

    #[error("RDMA error: {reason}")]
    Rdma { reason: String },

    #[error("notification rejected: {reason}")]
    NotifyFailed { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// A received frame did not follow the wire format. Always fatal to the connection.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidMagic { .. }
                | TransportError::VersionMismatch { .. }
                | TransportError::InvalidHeaderSize { .. }
                | TransportError::PayloadTooLarge { .. }
                | TransportError::Handshake { .. }
        )
    }

    /// The operation should simply be retried once the descriptor is ready again.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
