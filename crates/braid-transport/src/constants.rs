//! Timing and capacity constants for channels and groups.

use std::time::Duration;

/// Interval between heartbeat probes on every channel.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A channel with no committed probe for this long is cleaned up.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read deadline on the framed stream; refreshed every iteration so the
/// pump re-checks cancellation at least this often.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the group recomputes the useful set.
pub const RANKING_INTERVAL: Duration = Duration::from_secs(5);

/// A channel whose last probe commit is at least this old is excluded
/// from ranking (it may still recover).
pub const STALL_THRESHOLD: Duration = Duration::from_secs(5);

/// Capacity of each channel's outbound intake queue.
pub const INTAKE_CAPACITY: usize = 4;

/// Samples kept in the heartbeat RTT history.
pub const RTT_HISTORY: usize = 8;

/// Upper bound on probes awaiting replies before the oldest is dropped.
pub const MAX_IN_FLIGHT_PROBES: usize = 32;
