//! The multipath dispatch group.
//!
//! A group owns a dynamic, insertion-ordered list of channels, recomputes
//! the "useful" subset from their latency samples every ranking interval,
//! and dispatches each outbound batch onto exactly one useful channel.
//!
//! The useful set is published as an atomically-swapped index vector; the
//! indices are positions in the channel list at publish time, so dispatch
//! snapshots both under the list's read lock before racing the intakes.
//! An edge-triggered, single-slot signal wakes pending sends whenever the
//! published set changes content.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::select_all;
use futures::FutureExt;
use rand::seq::SliceRandom;
use tokio::sync::Notify;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::info;

use braid_core::Packet;

use crate::channel::{Channel, PacketSink};
use crate::constants::{RANKING_INTERVAL, STALL_THRESHOLD};
use crate::error::SendTimeoutError;
use crate::flow::Flow;

/// Aggregates many channels into one logical send operation.
pub struct Group {
    flow: Flow,
    /// Insertion-ordered channel list, newest first.
    channels: RwLock<Vec<Arc<Channel>>>,
    /// Published snapshot of useful positions; read-mostly.
    useful: ArcSwap<Vec<usize>>,
    /// Edge-triggered wake for pending sends on a useful-set change.
    new_useful: Notify,
}

/// Select the useful subset from `(round_trip, since_last_commit)` samples
/// taken at list positions.
///
/// Channels stalled for the threshold are excluded outright. Among the
/// survivors, anything at or below the mean of the extreme round trips is
/// useful; with two or fewer survivors everyone is kept so diversity never
/// narrows to an arbitrary single pick.
pub fn rank_useful(samples: &[(Duration, Duration)]) -> Vec<usize> {
    let survivors: Vec<(usize, Duration)> = samples
        .iter()
        .enumerate()
        .filter(|(_, (_, since_commit))| *since_commit < STALL_THRESHOLD)
        .map(|(position, (rtt, _))| (position, *rtt))
        .collect();

    if survivors.len() <= 2 {
        return survivors.into_iter().map(|(position, _)| position).collect();
    }

    let min = survivors
        .iter()
        .map(|(_, rtt)| *rtt)
        .min()
        .expect("survivors checked non-empty");
    let max = survivors
        .iter()
        .map(|(_, rtt)| *rtt)
        .max()
        .expect("survivors checked non-empty");
    let threshold = (min + max) / 2;

    survivors
        .into_iter()
        .filter(|(_, rtt)| *rtt <= threshold)
        .map(|(position, _)| position)
        .collect()
}

impl Group {
    /// Create a group under `parent`; closing the parent closes the group
    /// and every channel added to it.
    pub fn new(parent: &Flow) -> Arc<Self> {
        Arc::new(Self {
            flow: parent.fork(),
            channels: RwLock::new(Vec::new()),
            useful: ArcSwap::from_pointee(Vec::new()),
            new_useful: Notify::new(),
        })
    }

    /// The group's flow; channels join the group's lifetime by forking
    /// from it.
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// Start the ranking loop.
    pub fn run(self: &Arc<Self>) {
        let group = self.clone();
        let flow = self.flow.clone();
        self.flow.add_task(tokio::spawn(async move {
            let mut tick = interval(RANKING_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = flow.closed() => break,
                    _ = tick.tick() => group.update_useful(),
                }
            }
        }));
    }

    /// Cancel the group's flow, cascading to all channels.
    pub fn close(&self) {
        self.flow.close();
    }

    pub fn is_closed(&self) -> bool {
        self.flow.is_closed()
    }

    /// Append a channel (newest first) and register an on-close hook that
    /// splices it back out. Triggers an immediate ranking recompute.
    pub fn add_with_auto_remove(self: &Arc<Self>, channel: Arc<Channel>) {
        info!("new channel: {}", channel.name());
        {
            let mut list = self.channels.write().expect("channel list poisoned");
            list.insert(0, channel.clone());
        }

        let group = Arc::downgrade(self);
        let target = Arc::downgrade(&channel);
        channel.add_on_close(move || {
            if let Some(group) = group.upgrade() {
                group.remove_channel(&target);
            }
        });

        self.update_useful();
    }

    fn remove_channel(&self, target: &Weak<Channel>) {
        let removed = {
            let mut list = self.channels.write().expect("channel list poisoned");
            list.iter()
                .position(|c| Arc::as_ptr(c) == target.as_ptr())
                .map(|position| list.remove(position))
        };
        if let Some(channel) = removed {
            info!("remove channel: {}", channel.name());
        }
    }

    /// Best-effort dispatch of one batch onto a currently useful channel.
    ///
    /// Suspends only while every useful intake is full (or the useful set
    /// is empty), waking as soon as one accepts, the useful set changes,
    /// or the group closes. Returns `false` only in the latter case.
    pub async fn send(&self, batch: Vec<Packet>) -> bool {
        'snapshot: loop {
            if self.flow.is_closed() {
                return false;
            }

            // Arm the signal before snapshotting so a concurrent publish
            // is never missed.
            let notified = self.new_useful.notified();
            tokio::pin!(notified);

            let mut intakes: Vec<PacketSink> = {
                let list = self.channels.read().expect("channel list poisoned");
                let useful = self.useful.load();
                useful
                    .iter()
                    .filter_map(|&position| list.get(position))
                    .map(|channel| channel.chan_write())
                    .collect()
            };
            // Uniform tie-break when several intakes have capacity.
            intakes.shuffle(&mut rand::thread_rng());

            let mut pending: Vec<_> = intakes
                .into_iter()
                .map(|intake| intake.reserve_owned().boxed())
                .collect();

            loop {
                if pending.is_empty() {
                    tokio::select! {
                        _ = self.flow.closed() => return false,
                        _ = notified.as_mut() => continue 'snapshot,
                    }
                }

                let (result, _position, rest) = tokio::select! {
                    _ = self.flow.closed() => return false,
                    _ = notified.as_mut() => continue 'snapshot,
                    winner = select_all(pending) => winner,
                };

                match result {
                    Ok(permit) => {
                        let _ = permit.send(batch);
                        return true;
                    }
                    // That intake's channel is tearing down; keep racing
                    // the remaining candidates.
                    Err(_) => pending = rest,
                }
            }
        }
    }

    /// [`send`](Self::send) with an upper bound: fails with an overflow
    /// error if nothing accepted the batch within `deadline` (or the
    /// group closed first). The batch is dropped on failure.
    pub async fn send_timeout(
        &self,
        batch: Vec<Packet>,
        deadline: Duration,
    ) -> Result<(), SendTimeoutError> {
        match timeout(deadline, self.send(batch)).await {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(SendTimeoutError(deadline)),
        }
    }

    /// The published useful positions.
    pub fn get_useful(&self) -> Arc<Vec<usize>> {
        self.useful.load_full()
    }

    /// The channels currently in the useful set.
    pub fn get_useful_chan(&self) -> Vec<Arc<Channel>> {
        let list = self.channels.read().expect("channel list poisoned");
        let useful = self.useful.load();
        useful
            .iter()
            .filter_map(|&position| list.get(position).cloned())
            .collect()
    }

    /// All channels, newest first.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .expect("channel list poisoned")
            .clone()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().expect("channel list poisoned").len()
    }

    /// One line per channel: display name and heartbeat counters.
    pub fn get_stats_info(&self) -> String {
        let list = self.channels.read().expect("channel list poisoned");
        let mut out = String::new();
        for channel in list.iter() {
            out.push_str(&format!("{}: {}\n", channel.name(), channel.stat()));
        }
        out
    }

    /// Recompute and publish the useful set; raise the signal when the
    /// content changed.
    fn update_useful(&self) {
        let changed = {
            let list = self.channels.read().expect("channel list poisoned");
            let samples: Vec<(Duration, Duration)> =
                list.iter().map(|channel| channel.latency()).collect();
            let useful = rank_useful(&samples);

            let previous = self.useful.load();
            let changed = **previous != useful;
            if changed {
                self.useful.store(Arc::new(useful));
            }
            changed
        };

        if changed {
            // Single-slot and edge-triggered: a pending wake absorbs this.
            self.new_useful.notify_one();
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("channels", &self.channel_count())
            .field("useful", &self.get_useful())
            .field("closed", &self.is_closed())
            .finish()
    }
}
