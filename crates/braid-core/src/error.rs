//! Error types for the wire data model.

/// Errors from encoding or decoding individual packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("invalid packet type: 0x{0:02x}")]
    InvalidType(u8),

    #[error("packet truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("packet payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Errors from reading, verifying, or unmarshalling an L2 frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad frame magic: 0x{0:04x}")]
    BadMagic(u16),

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("frame truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("session stamp mismatch for user {user_id}")]
    BadStamp { user_id: u32 },

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}
