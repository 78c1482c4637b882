//! Heartbeat probes and latency measurement.
//!
//! The stage mints probes carrying a monotonic sequence, matches replies
//! by payload, and maintains a smoothed round-trip estimate plus the time
//! of the last committed probe. A supervision timer turns a quiet channel
//! into a stall error for the owner to act on.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval, Instant};

use braid_core::Packet;

use crate::constants::{HEARTBEAT_INTERVAL, MAX_IN_FLIGHT_PROBES, RTT_HISTORY};
use crate::error::ChannelError;
use crate::flow::Flow;

/// Probe issuing, reply matching, and latency tracking for one channel.
pub struct HeartBeatStage {
    timeout: Duration,
    seq: AtomicU64,
    inner: Mutex<Inner>,
}

struct Inner {
    in_flight: VecDeque<Probe>,
    smoothed: Option<Duration>,
    history: VecDeque<Duration>,
    last_commit: Instant,
    sent: u64,
    received: u64,
    min_rtt: Option<Duration>,
    max_rtt: Option<Duration>,
    rtt_sum: Duration,
}

struct Probe {
    payload: [u8; 8],
    sent_at: Instant,
}

/// Aggregate counters reported by [`HeartBeatStage::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeatStat {
    pub sent: u64,
    pub received: u64,
    pub min_rtt: Duration,
    pub mean_rtt: Duration,
    pub max_rtt: Duration,
    pub smoothed_rtt: Duration,
}

impl HeartBeatStage {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            seq: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                in_flight: VecDeque::new(),
                smoothed: None,
                history: VecDeque::new(),
                last_commit: Instant::now(),
                sent: 0,
                received: 0,
                min_rtt: None,
                max_rtt: None,
                rtt_sum: Duration::ZERO,
            }),
        }
    }

    /// Mint a new probe. The probe is not tracked until [`add`](Self::add)
    /// is called, so the measured interval starts after the write returns.
    pub fn new_probe(&self) -> Packet {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        Packet::heartbeat(seq.to_be_bytes().to_vec())
    }

    /// Register a just-written probe as in-flight.
    pub fn add(&self, probe: &Packet) {
        let Ok(payload) = <[u8; 8]>::try_from(probe.payload()) else {
            return;
        };
        let mut inner = self.lock();
        inner.in_flight.push_back(Probe {
            payload,
            sent_at: Instant::now(),
        });
        inner.sent += 1;
        while inner.in_flight.len() > MAX_IN_FLIGHT_PROBES {
            inner.in_flight.pop_front();
        }
    }

    /// Match an incoming reply against the in-flight set and commit the
    /// round trip. Unmatched replies are ignored.
    pub fn receive(&self, reply: &Packet) {
        let now = Instant::now();
        let mut inner = self.lock();

        let Some(pos) = inner
            .in_flight
            .iter()
            .position(|p| p.payload == reply.payload())
        else {
            return;
        };
        let probe = inner.in_flight.remove(pos).expect("position just found");
        let rtt = now.saturating_duration_since(probe.sent_at);

        inner.smoothed = Some(match inner.smoothed {
            // EWMA, weight 1/8 on the new sample.
            Some(prev) => prev.mul_f64(0.875) + rtt.mul_f64(0.125),
            None => rtt,
        });
        inner.history.push_back(rtt);
        while inner.history.len() > RTT_HISTORY {
            inner.history.pop_front();
        }

        inner.last_commit = now;
        inner.received += 1;
        inner.rtt_sum += rtt;
        inner.min_rtt = Some(inner.min_rtt.map_or(rtt, |m| m.min(rtt)));
        inner.max_rtt = Some(inner.max_rtt.map_or(rtt, |m| m.max(rtt)));

        // Probes older than the matched one will never commit.
        let timeout = self.timeout;
        inner
            .in_flight
            .retain(|p| now.saturating_duration_since(p.sent_at) < timeout);
    }

    /// `(round_trip, since_last_commit)` snapshot. Before the first commit
    /// the round trip reports the stage timeout, ranking an unproven
    /// channel behind any measured one.
    pub fn latency(&self) -> (Duration, Duration) {
        let inner = self.lock();
        let rtt = inner.smoothed.unwrap_or(self.timeout);
        (rtt, inner.last_commit.elapsed())
    }

    /// Aggregate counters.
    pub fn stat(&self) -> HeartBeatStat {
        let inner = self.lock();
        let mean = if inner.received > 0 {
            inner.rtt_sum / inner.received as u32
        } else {
            Duration::ZERO
        };
        HeartBeatStat {
            sent: inner.sent,
            received: inner.received,
            min_rtt: inner.min_rtt.unwrap_or(Duration::ZERO),
            mean_rtt: mean,
            max_rtt: inner.max_rtt.unwrap_or(Duration::ZERO),
            smoothed_rtt: inner.smoothed.unwrap_or(Duration::ZERO),
        }
    }

    /// Supervision timer: resolves with a stall error once nothing has
    /// committed for the stage timeout, or with `None` when the flow
    /// closes first. The owner is expected to tear the channel down on a
    /// stall.
    pub async fn supervise(self: Arc<Self>, flow: Flow) -> Option<ChannelError> {
        let mut tick = interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = flow.closed() => return None,
                _ = tick.tick() => {
                    let quiet = self.lock().last_commit.elapsed();
                    if quiet >= self.timeout {
                        return Some(ChannelError::HeartbeatStall(quiet));
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("heartbeat state poisoned")
    }
}

impl fmt::Display for HeartBeatStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {} recv {} rtt {:?}/{:?}/{:?} ewma {:?}",
            self.sent, self.received, self.min_rtt, self.mean_rtt, self.max_rtt, self.smoothed_rtt,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage() -> HeartBeatStage {
        HeartBeatStage::new(Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn reply_commits_round_trip() {
        let hb = stage();
        let probe = hb.new_probe();
        hb.add(&probe);

        tokio::time::advance(Duration::from_millis(40)).await;
        hb.receive(&probe.reply());

        let (rtt, since) = hb.latency();
        assert_eq!(rtt, Duration::from_millis(40));
        // Latency recency: since_last_commit is bounded by time since the
        // latest reply.
        assert!(since <= Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn ewma_smooths_later_samples() {
        let hb = stage();

        let first = hb.new_probe();
        hb.add(&first);
        tokio::time::advance(Duration::from_millis(80)).await;
        hb.receive(&first.reply());

        let second = hb.new_probe();
        hb.add(&second);
        tokio::time::advance(Duration::from_millis(160)).await;
        hb.receive(&second.reply());

        let (rtt, _) = hb.latency();
        // 80 * 0.875 + 160 * 0.125 = 90, modulo float rounding
        let expect = Duration::from_millis(90);
        let diff = if rtt > expect { rtt - expect } else { expect - rtt };
        assert!(diff < Duration::from_millis(1), "ewma was {rtt:?}");
    }

    #[test]
    fn unmatched_reply_is_ignored() {
        let hb = stage();
        let probe = hb.new_probe();
        hb.add(&probe);

        hb.receive(&Packet::heartbeat(vec![9, 9, 9, 9, 9, 9, 9, 9]).reply());

        let stat = hb.stat();
        assert_eq!(stat.sent, 1);
        assert_eq!(stat.received, 0);
    }

    #[test]
    fn reply_matches_at_most_once() {
        let hb = stage();
        let probe = hb.new_probe();
        hb.add(&probe);

        hb.receive(&probe.reply());
        hb.receive(&probe.reply());

        assert_eq!(hb.stat().received, 1);
    }

    #[test]
    fn probes_carry_unique_payloads() {
        let hb = stage();
        let a = hb.new_probe();
        let b = hb.new_probe();
        assert_ne!(a.payload(), b.payload());
    }

    #[tokio::test(start_paused = true)]
    async fn stat_tracks_min_mean_max() {
        let hb = stage();
        for ms in [10u64, 30, 20] {
            let probe = hb.new_probe();
            hb.add(&probe);
            tokio::time::advance(Duration::from_millis(ms)).await;
            hb.receive(&probe.reply());
        }

        let stat = hb.stat();
        assert_eq!(stat.sent, 3);
        assert_eq!(stat.received, 3);
        assert_eq!(stat.min_rtt, Duration::from_millis(10));
        assert_eq!(stat.max_rtt, Duration::from_millis(30));
        assert_eq!(stat.mean_rtt, Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn supervise_reports_stall() {
        let hb = Arc::new(HeartBeatStage::new(Duration::from_secs(5)));
        let flow = Flow::new();

        let result = hb.supervise(flow).await;
        match result {
            Some(ChannelError::HeartbeatStall(quiet)) => {
                assert!(quiet >= Duration::from_secs(5));
            }
            other => panic!("expected stall, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn supervise_exits_quietly_on_flow_close() {
        let hb = Arc::new(HeartBeatStage::new(Duration::from_secs(5)));
        let flow = Flow::new();

        let handle = tokio::spawn(hb.supervise(flow.clone()));
        tokio::time::advance(Duration::from_secs(1)).await;
        flow.close();

        let result = handle.await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn commits_keep_supervision_alive() {
        let hb = Arc::new(HeartBeatStage::new(Duration::from_secs(5)));
        let flow = Flow::new();
        let handle = tokio::spawn(hb.clone().supervise(flow.clone()));

        // Keep committing for a while; the supervisor must not fire.
        for _ in 0..8 {
            let probe = hb.new_probe();
            hb.add(&probe);
            tokio::time::advance(Duration::from_secs(3)).await;
            hb.receive(&probe.reply());
            tokio::task::yield_now().await;
            assert!(!handle.is_finished());
        }

        flow.close();
        assert!(handle.await.unwrap().is_none());
    }
}
