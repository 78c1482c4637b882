//! The client endpoint: a group of dialed channels with redial.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use braid_core::{Packet, Session};
use braid_transport::{Channel, Flow, Group};

use crate::error::NodeError;

/// Wait between redial attempts for a lost channel.
const REDIAL_WAIT: Duration = Duration::from_secs(5);

/// Capacity of the client's receive sink.
const RECV_CAPACITY: usize = 64;

/// Dials channels to the configured peers, keeps them alive, and exposes
/// the group for sending.
pub struct BraidClient {
    flow: Flow,
    session: Session,
    group: Arc<Group>,
    recv_sink: mpsc::Sender<Vec<Packet>>,
}

impl BraidClient {
    pub fn new(parent: &Flow, session: Session) -> Arc<Self> {
        let flow = parent.fork();
        let group = Group::new(&flow);
        group.run();

        let (recv_sink, recv_rx) = mpsc::channel(RECV_CAPACITY);
        flow.add_task(tokio::spawn(consume_received(flow.clone(), recv_rx)));

        Arc::new(Self {
            flow,
            session,
            group,
            recv_sink,
        })
    }

    /// The dispatch group; hand it outbound batches via
    /// [`Group::send`](braid_transport::Group::send).
    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    pub fn close(&self) {
        self.flow.close();
    }

    /// Keep `count` channels open to `peer`, redialing each slot whenever
    /// its channel closes.
    pub fn maintain_peer(self: &Arc<Self>, peer: String, count: usize) {
        for slot in 0..count {
            let client = self.clone();
            let peer = peer.clone();
            self.flow.add_task(tokio::spawn(async move {
                client.peer_loop(peer, slot).await;
            }));
        }
    }

    async fn peer_loop(&self, peer: String, slot: usize) {
        loop {
            if self.flow.is_closed() {
                break;
            }

            match TcpStream::connect(&peer).await {
                Ok(stream) => {
                    let channel = Channel::client(
                        self.group.flow(),
                        self.session.clone(),
                        stream,
                        self.recv_sink.clone(),
                    );
                    channel.run();
                    info!("client: dialed {peer} (slot {slot}): {}", channel.name());
                    self.group.add_with_auto_remove(channel.clone());

                    channel.closed().await;
                }
                Err(e) => {
                    debug!("client: connect to {peer} failed: {e}");
                }
            }

            if self.flow.is_closed() {
                break;
            }
            tokio::select! {
                _ = self.flow.closed() => break,
                _ = tokio::time::sleep(REDIAL_WAIT) => {}
            }
        }
    }

    /// Dial every configured peer. Fails fast if a peer address is
    /// syntactically unusable.
    pub fn start(self: &Arc<Self>, peers: &[String], channels_per_peer: usize) -> Result<(), NodeError> {
        if peers.is_empty() {
            return Err(NodeError::Config("client has no peers".into()));
        }
        for peer in peers {
            self.maintain_peer(peer.clone(), channels_per_peer);
        }
        Ok(())
    }
}

/// Drain data packets arriving from any channel. The consumer side of the
/// data plane lives outside this process; the node accounts and drops.
async fn consume_received(flow: Flow, mut rx: mpsc::Receiver<Vec<Packet>>) {
    let mut total: u64 = 0;
    loop {
        tokio::select! {
            _ = flow.closed() => break,
            batch = rx.recv() => match batch {
                Some(batch) => {
                    total += batch.len() as u64;
                    debug!("client: received {} data packets ({total} total)", batch.len());
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::BraidServer;

    #[tokio::test]
    async fn client_redials_until_channels_are_up() {
        let root = Flow::new();
        let server = BraidServer::new(
            &root,
            Session::new([0x55; 32], 1000),
            "127.0.0.1:0".parse().unwrap(),
        );
        let addr = server.start().await.unwrap();

        let client = BraidClient::new(&root, Session::new([0x55; 32], 3));
        client.start(&[addr.to_string()], 2).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while client.group().channel_count() < 2 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "client never established both channels"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Both channels are fresh, so the add-time recompute made them
        // useful; a send must land.
        assert!(client.group().send(vec![Packet::data(b"ping".to_vec())]).await);

        root.close();
    }

    #[tokio::test]
    async fn start_rejects_empty_peer_list() {
        let root = Flow::new();
        let client = BraidClient::new(&root, Session::new([0x55; 32], 3));
        assert!(client.start(&[], 2).is_err());
        root.close();
    }
}
