//! The application-visible packet unit.
//!
//! The transport layer only inspects the type tag on receive and the wire
//! size for accounting; payload bytes are opaque.

use crate::constants::{MAX_PACKET_PAYLOAD, PACKET_HEADER_SIZE};
use crate::error::PacketError;

/// Packet type tags carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Application data, opaque to the transport.
    Data = 0x01,
    /// Latency probe.
    Heartbeat = 0x02,
    /// Reply to a probe, payload echoed verbatim.
    HeartbeatReply = 0x03,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Data),
            0x02 => Ok(PacketType::Heartbeat),
            0x03 => Ok(PacketType::HeartbeatReply),
            other => Err(PacketError::InvalidType(other)),
        }
    }
}

/// An addressable unit carried by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    ptype: PacketType,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(ptype: PacketType, payload: Vec<u8>) -> Self {
        Self { ptype, payload }
    }

    /// A data packet wrapping an opaque payload.
    pub fn data(payload: Vec<u8>) -> Self {
        Self::new(PacketType::Data, payload)
    }

    /// A heartbeat probe carrying an opaque identifier.
    pub fn heartbeat(payload: Vec<u8>) -> Self {
        Self::new(PacketType::Heartbeat, payload)
    }

    /// Synthesize the reply to a probe; the payload is echoed verbatim so
    /// the sender can match pairs.
    pub fn reply(&self) -> Packet {
        Packet::new(PacketType::HeartbeatReply, self.payload.clone())
    }

    pub fn ptype(&self) -> PacketType {
        self.ptype
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Encoded wire size: type(1) + len(4) + payload.
    pub fn size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Append the wire encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.ptype as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Decode one packet from the front of `buf`, returning it and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Packet, usize), PacketError> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::Truncated {
                need: PACKET_HEADER_SIZE,
                got: buf.len(),
            });
        }

        let ptype = PacketType::try_from(buf[0])?;
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > MAX_PACKET_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(len));
        }

        let total = PACKET_HEADER_SIZE + len;
        if buf.len() < total {
            return Err(PacketError::Truncated {
                need: total,
                got: buf.len(),
            });
        }

        let payload = buf[PACKET_HEADER_SIZE..total].to_vec();
        Ok((Packet { ptype, payload }, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_round_trip() {
        for t in [
            PacketType::Data,
            PacketType::Heartbeat,
            PacketType::HeartbeatReply,
        ] {
            assert_eq!(PacketType::try_from(t as u8).unwrap(), t);
        }
        assert!(matches!(
            PacketType::try_from(0x7f),
            Err(PacketError::InvalidType(0x7f))
        ));
    }

    #[test]
    fn reply_echoes_payload_verbatim() {
        let probe = Packet::heartbeat(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let reply = probe.reply();
        assert_eq!(reply.ptype(), PacketType::HeartbeatReply);
        assert_eq!(reply.payload(), probe.payload());
    }

    #[test]
    fn encode_decode_round_trip() {
        let p = Packet::data(b"hello braid".to_vec());
        let mut buf = Vec::new();
        p.encode_into(&mut buf);
        assert_eq!(buf.len(), p.size());

        let (decoded, consumed) = Packet::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, p);
    }

    #[test]
    fn decode_rejects_truncated() {
        let p = Packet::data(vec![0xAA; 32]);
        let mut buf = Vec::new();
        p.encode_into(&mut buf);

        assert!(matches!(
            Packet::decode(&buf[..3]),
            Err(PacketError::Truncated { .. })
        ));
        assert!(matches!(
            Packet::decode(&buf[..buf.len() - 1]),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized_payload_len() {
        let mut buf = vec![0u8; PACKET_HEADER_SIZE];
        buf[0] = PacketType::Data as u8;
        buf[1..5].copy_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(
            Packet::decode(&buf),
            Err(PacketError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn empty_payload_is_valid() {
        let p = Packet::heartbeat(Vec::new());
        let mut buf = Vec::new();
        p.encode_into(&mut buf);
        let (decoded, consumed) = Packet::decode(&buf).unwrap();
        assert_eq!(consumed, PACKET_HEADER_SIZE);
        assert!(decoded.payload().is_empty());
    }
}
