//! Server-side user registry.
//!
//! Each user id maps to a [`Group`] aggregating that user's channels and a
//! receive sink drained by a per-user consumer task. The registry is the
//! [`ServerInitDelegate`] for every accepted channel: the first verified
//! frame resolves the peer's user id into its sink, and `on_inited` adds
//! the channel to the user's group.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info};

use braid_transport::channel::{Channel, PacketSink, ServerInitDelegate};
use braid_transport::{Flow, Group};

/// Capacity of each user's receive sink.
const USER_SINK_CAPACITY: usize = 64;

/// Tracks per-user groups and receive sinks on the server side.
pub struct UserRegistry {
    flow: Flow,
    users: Mutex<HashMap<u32, UserEntry>>,
}

#[derive(Clone)]
struct UserEntry {
    group: Arc<Group>,
    sink: PacketSink,
}

impl UserRegistry {
    pub fn new(parent: &Flow) -> Arc<Self> {
        Arc::new(Self {
            flow: parent.fork(),
            users: Mutex::new(HashMap::new()),
        })
    }

    /// `(user_id, group)` pairs for introspection.
    pub fn users(&self) -> Vec<(u32, Arc<Group>)> {
        let users = self.users.lock().expect("user table poisoned");
        let mut list: Vec<(u32, Arc<Group>)> = users
            .iter()
            .map(|(id, entry)| (*id, entry.group.clone()))
            .collect();
        list.sort_by_key(|(id, _)| *id);
        list
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().expect("user table poisoned").len()
    }

    fn entry(&self, user_id: u32) -> UserEntry {
        let mut users = self.users.lock().expect("user table poisoned");
        users
            .entry(user_id)
            .or_insert_with(|| {
                info!("new user: {user_id}");
                let group = Group::new(&self.flow);
                group.run();

                let (sink, rx) = mpsc::channel(USER_SINK_CAPACITY);
                self.flow.add_task(tokio::spawn(consume_user_data(
                    self.flow.clone(),
                    user_id,
                    rx,
                )));

                UserEntry { group, sink }
            })
            .clone()
    }
}

/// Drain a user's receive sink.
///
/// The data plane proper (tunnel interface) lives outside this process;
/// the node accounts for what arrived and drops it.
async fn consume_user_data(
    flow: Flow,
    user_id: u32,
    mut rx: mpsc::Receiver<Vec<braid_core::Packet>>,
) {
    let mut total: u64 = 0;
    loop {
        tokio::select! {
            _ = flow.closed() => break,
            batch = rx.recv() => match batch {
                Some(batch) => {
                    total += batch.len() as u64;
                    debug!("user {user_id}: received {} data packets ({total} total)", batch.len());
                }
                None => break,
            }
        }
    }
}

impl ServerInitDelegate for UserRegistry {
    fn init(&self, user_id: u32) -> Result<PacketSink, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.entry(user_id).sink)
    }

    fn on_inited(&self, channel: &Arc<Channel>) {
        let entry = self.entry(channel.user_id());
        entry.group.add_with_auto_remove(channel.clone());
    }
}
