//! The L2 frame: a session-stamped, verifiable batch of packets.
//!
//! Wire layout, all multi-byte fields big-endian:
//!
//! ```text
//! magic(2) | len(4) | user_id(4) | stamp(16) | body
//! ```
//!
//! `len` counts everything after itself. `body` is the concatenation of
//! packet encodings in batch order. The sender's user id is readable
//! before unmarshalling, which server-side lazy initialization relies on.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_LEN, STAMP_SIZE};
use crate::error::FrameError;
use crate::packet::Packet;
use crate::session::Session;

/// Fixed part of the frame after the length field.
const FRAME_FIXED: usize = 4 + STAMP_SIZE;

/// A received or about-to-be-sent L2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    user_id: u32,
    stamp: [u8; STAMP_SIZE],
    body: Vec<u8>,
}

impl Frame {
    pub(crate) fn from_parts(user_id: u32, stamp: [u8; STAMP_SIZE], body: Vec<u8>) -> Self {
        Self {
            user_id,
            stamp,
            body,
        }
    }

    /// The sender's user id, available before `unmarshal`.
    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    /// Total encoded size on the wire.
    pub fn wire_size(&self) -> usize {
        FRAME_HEADER_SIZE + FRAME_FIXED + self.body.len()
    }

    /// Check the session stamp against the frame contents.
    pub fn verify(&self, session: &Session) -> Result<(), FrameError> {
        let expect = session.stamp(self.user_id, &self.body);
        if expect != self.stamp {
            return Err(FrameError::BadStamp {
                user_id: self.user_id,
            });
        }
        Ok(())
    }

    /// Decode the body into its packet batch, preserving order.
    pub fn unmarshal(&self) -> Result<Vec<Packet>, FrameError> {
        let mut packets = Vec::new();
        let mut rest = &self.body[..];
        while !rest.is_empty() {
            let (p, n) = Packet::decode(rest)?;
            packets.push(p);
            rest = &rest[n..];
        }
        Ok(packets)
    }

    /// Encode the frame into wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let len = FRAME_FIXED + self.body.len();
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + len);
        buf.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        buf.extend_from_slice(&(len as u32).to_be_bytes());
        buf.extend_from_slice(&self.user_id.to_be_bytes());
        buf.extend_from_slice(&self.stamp);
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode a frame from a complete byte buffer.
    pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated {
                need: FRAME_HEADER_SIZE,
                got: buf.len(),
            });
        }
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if len < FRAME_FIXED {
            return Err(FrameError::Truncated {
                need: FRAME_FIXED,
                got: len,
            });
        }
        let total = FRAME_HEADER_SIZE + len;
        if buf.len() < total {
            return Err(FrameError::Truncated {
                need: total,
                got: buf.len(),
            });
        }

        Ok(Self::split_payload(&buf[FRAME_HEADER_SIZE..total]))
    }

    /// Read one frame from an async byte stream (`read_l2`).
    pub async fn read<R>(reader: &mut R) -> Result<Frame, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let magic = u16::from_be_bytes([header[0], header[1]]);
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if len < FRAME_FIXED {
            return Err(FrameError::Truncated {
                need: FRAME_FIXED,
                got: len,
            });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Self::split_payload(&payload))
    }

    /// Write the frame to an async byte stream (`write_l2`), returning the
    /// number of bytes written.
    pub async fn write<W>(&self, writer: &mut W) -> Result<usize, FrameError>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode();
        writer.write_all(&bytes).await?;
        Ok(bytes.len())
    }

    fn split_payload(payload: &[u8]) -> Frame {
        let user_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let mut stamp = [0u8; STAMP_SIZE];
        stamp.copy_from_slice(&payload[4..4 + STAMP_SIZE]);
        let body = payload[FRAME_FIXED..].to_vec();
        Frame {
            user_id,
            stamp,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    fn session() -> Session {
        Session::new([0x5A; 32], 9)
    }

    fn sample_batch() -> Vec<Packet> {
        vec![
            Packet::data(b"first".to_vec()),
            Packet::heartbeat(vec![0, 0, 0, 0, 0, 0, 0, 1]),
            Packet::data(b"second".to_vec()),
        ]
    }

    #[test]
    fn wrap_verify_unmarshal_preserves_batch() {
        let s = session();
        let batch = sample_batch();

        let frame = s.wrap(&batch);
        frame.verify(&s).unwrap();
        assert_eq!(frame.user_id(), 9);
        assert_eq!(frame.unmarshal().unwrap(), batch);
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let frame = session().wrap(&sample_batch());
        let other = Session::new([0xA5; 32], 9);
        assert!(matches!(
            frame.verify(&other),
            Err(FrameError::BadStamp { user_id: 9 })
        ));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let s = session();
        let mut bytes = s.wrap(&sample_batch()).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let frame = Frame::decode(&bytes).unwrap();
        assert!(frame.verify(&s).is_err());
    }

    #[test]
    fn verify_rejects_tampered_user_id() {
        let s = session();
        let mut bytes = s.wrap(&sample_batch()).encode();
        // user_id sits right after magic(2) + len(4)
        bytes[FRAME_HEADER_SIZE + 3] ^= 0x01;

        let frame = Frame::decode(&bytes).unwrap();
        assert!(frame.verify(&s).is_err());
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = session().wrap(&sample_batch()).encode();
        bytes[0] = 0x00;
        assert!(matches!(Frame::decode(&bytes), Err(FrameError::BadMagic(_))));
    }

    #[test]
    fn decode_rejects_oversized_len() {
        let mut bytes = vec![0u8; FRAME_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        bytes[2..6].copy_from_slice(&(u32::MAX).to_be_bytes());
        assert!(matches!(Frame::decode(&bytes), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn unmarshal_rejects_garbage_body() {
        let s = session();
        let body = vec![0xEE; 7];
        let stamp = s.stamp(s.user_id(), &body);
        let frame = Frame::from_parts(s.user_id(), stamp, body);

        frame.verify(&s).unwrap();
        assert!(frame.unmarshal().is_err());
    }

    #[tokio::test]
    async fn async_read_write_round_trip() {
        let s = session();
        let batch = sample_batch();
        let frame = s.wrap(&batch);

        let (mut a, mut b) = tokio::io::duplex(4096);
        let n = frame.write(&mut a).await.unwrap();
        assert_eq!(n, frame.wire_size());

        let got = Frame::read(&mut b).await.unwrap();
        assert_eq!(got, frame);
        got.verify(&s).unwrap();
        assert_eq!(got.unmarshal().unwrap(), batch);
    }

    #[tokio::test]
    async fn async_read_sees_frames_in_order() {
        let s = session();
        let (mut a, mut b) = tokio::io::duplex(4096);

        for i in 0..3u8 {
            let frame = s.wrap(&[Packet::data(vec![i])]);
            frame.write(&mut a).await.unwrap();
        }

        for i in 0..3u8 {
            let frame = Frame::read(&mut b).await.unwrap();
            let batch = frame.unmarshal().unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].ptype(), PacketType::Data);
            assert_eq!(batch[0].payload(), &[i]);
        }
    }
}
