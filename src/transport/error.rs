use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The stream ended part-way through a frame.
    #[error("truncated frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unsupported protocol version {received} (supported up to {supported})")]
    UnsupportedVersion { received: u16, supported: u16 },

    #[error("connection closed")]
    Closed,

    /// The peer is not draining its socket and the write queue is full.
    #[error("write queue full")]
    QueueFull,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for errors caused by the bytes on the wire rather than the
    /// socket itself.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TransportError::Truncated { .. }
                | TransportError::FrameTooLarge { .. }
                | TransportError::Malformed(_)
                | TransportError::UnsupportedVersion { .. }
        )
    }
}
