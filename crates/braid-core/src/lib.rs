//! Wire-level data model for the braid multipath dispatch group.
//!
//! This crate defines the units the transport layer moves around:
//!
//! - `packet`: the application-visible unit, tagged as data or heartbeat
//! - `session`: the shared framing/authentication context between endpoints
//! - `wire`: the L2 frame — a session-stamped, verifiable batch of packets

pub mod constants;
pub mod error;
pub mod packet;
pub mod session;
pub mod wire;

pub use packet::{Packet, PacketType};
pub use session::Session;
pub use wire::Frame;
