//! The shared framing/authentication context between two endpoints.
//!
//! A session is a stamp: outbound frames are sealed with a truncated
//! SHA-256 over the shared secret, the sender's user id, and the frame
//! body; inbound frames are verified against the same computation.

use sha2::{Digest, Sha256};

use crate::constants::{SECRET_SIZE, STAMP_SIZE};
use crate::packet::Packet;
use crate::wire::Frame;

/// Shared framing context. Cheap to clone; one per channel.
#[derive(Debug, Clone)]
pub struct Session {
    secret: [u8; SECRET_SIZE],
    user_id: u32,
}

impl Session {
    pub fn new(secret: [u8; SECRET_SIZE], user_id: u32) -> Self {
        Self { secret, user_id }
    }

    /// The stable user id this endpoint stamps outbound frames with.
    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    /// Wrap an ordered batch of packets into an L2 frame stamped by this
    /// session.
    pub fn wrap(&self, batch: &[Packet]) -> Frame {
        let mut body = Vec::with_capacity(batch.iter().map(Packet::size).sum());
        for p in batch {
            p.encode_into(&mut body);
        }
        let stamp = self.stamp(self.user_id, &body);
        Frame::from_parts(self.user_id, stamp, body)
    }

    /// Compute the stamp for a (user id, body) pair.
    pub(crate) fn stamp(&self, user_id: u32, body: &[u8]) -> [u8; STAMP_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(user_id.to_be_bytes());
        hasher.update(body);
        let digest = hasher.finalize();

        let mut stamp = [0u8; STAMP_SIZE];
        stamp.copy_from_slice(&digest[..STAMP_SIZE]);
        stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_depends_on_all_inputs() {
        let a = Session::new([1u8; 32], 7);
        let b = Session::new([2u8; 32], 7);

        let body = b"some frame body";
        assert_ne!(a.stamp(7, body), b.stamp(7, body));
        assert_ne!(a.stamp(7, body), a.stamp(8, body));
        assert_ne!(a.stamp(7, body), a.stamp(7, b"other body"));
        assert_eq!(a.stamp(7, body), a.stamp(7, body));
    }

    #[test]
    fn user_id_is_stable() {
        let s = Session::new([0u8; 32], 42);
        assert_eq!(s.user_id(), 42);
        assert_eq!(s.clone().user_id(), 42);
    }
}
