//! Multipath packet-dispatch group.
//!
//! A [`Group`] manages a dynamic set of framed, heartbeated [`Channel`]s
//! between two endpoints, continuously ranks them by observed round-trip
//! latency, and dispatches outbound packet batches onto the fastest
//! available subset — one logical send with implicit failover, load
//! spreading, and live re-ranking.

pub mod channel;
pub mod constants;
pub mod error;
pub mod flow;
pub mod group;
pub mod heartbeat;
pub mod speed;

pub use channel::{Channel, PacketSink, ServerInitDelegate};
pub use error::ChannelError;
pub use flow::Flow;
pub use group::Group;
pub use heartbeat::HeartBeatStage;
pub use speed::{Speed, SpeedInfo};
