use thiserror::Error;

/// All errors produced by the RelStream transport.
#[derive(Debug, Error)]
pub enum RelStreamError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("length mismatch: header declares {declared} bytes, datagram holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("invalid packet length: {0}")]
    InvalidLength(u16),

    #[error("checksum mismatch: carried 0x{carried:04x}, computed 0x{computed:04x}")]
    ChecksumMismatch { carried: u16, computed: u16 },

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("connection {0} not found")]
    ConnectionNotFound(u64),

    #[error("sequence space exhausted")]
    SequenceExhausted,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl RelStreamError {
    /// Whether this error means a received datagram was damaged in transit.
    ///
    /// Every decode failure counts: a flipped bit may land in the length
    /// field just as easily as in the payload.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RelStreamError::PacketTooShort { .. }
                | RelStreamError::LengthMismatch { .. }
                | RelStreamError::InvalidLength(_)
                | RelStreamError::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RelStreamError>;
