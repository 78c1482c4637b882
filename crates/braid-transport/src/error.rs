//! Error types for the transport layer.

use std::time::Duration;

use braid_core::error::{FrameError, PacketError};

/// Fatal channel errors, recorded as the channel's exit error.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("read error: {0}")]
    Read(std::io::Error),

    #[error("write error: {0}")]
    Write(std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("heartbeat stalled: no probe committed for {0:?}")]
    HeartbeatStall(Duration),

    #[error("delegate init failed for user {user_id}: {reason}")]
    InitFailed { user_id: u32, reason: String },
}

/// Returned by [`Group::send_timeout`](crate::Group::send_timeout) when no
/// useful channel accepted the batch within the deadline.
#[derive(Debug, thiserror::Error)]
#[error("no useful channel accepted the batch within {0:?}")]
pub struct SendTimeoutError(pub Duration);

/// Whether an I/O error means the underlying stream was closed under us.
///
/// A closed stream is graceful termination, not a fault: no exit error is
/// recorded for it.
pub(crate) fn is_closed_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    ) || err.to_string().contains("closed")
}

/// Whether an I/O error is transient and the read should simply retry.
pub(crate) fn is_transient_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}
