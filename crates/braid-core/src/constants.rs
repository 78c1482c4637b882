//! Wire format constants.

/// Magic number identifying braid L2 frames ("BR").
pub const FRAME_MAGIC: u16 = 0x4252;

/// Size of the session stamp carried in every frame.
pub const STAMP_SIZE: usize = 16;

/// Size of the shared session secret.
pub const SECRET_SIZE: usize = 32;

/// Fixed frame header: magic(2) + len(4).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Per-packet header inside a frame body: type(1) + len(4).
pub const PACKET_HEADER_SIZE: usize = 5;

/// Upper bound on the length field of a single frame.
///
/// Bounds allocation when decoding from an untrusted stream.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Upper bound on a single packet's payload; a packet must fit inside
/// one frame.
pub const MAX_PACKET_PAYLOAD: usize = MAX_FRAME_LEN - PACKET_HEADER_SIZE;
