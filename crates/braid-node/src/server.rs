//! The server endpoint: accept loop spawning server-mode channels.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use braid_core::Session;
use braid_transport::{Channel, Flow};

use crate::error::NodeError;
use crate::users::UserRegistry;

/// Accepts connections and hands each one to the user registry as a
/// server-mode channel.
pub struct BraidServer {
    flow: Flow,
    session: Session,
    listen: SocketAddr,
    registry: Arc<UserRegistry>,
}

impl BraidServer {
    pub fn new(parent: &Flow, session: Session, listen: SocketAddr) -> Self {
        let flow = parent.fork();
        let registry = UserRegistry::new(&flow);
        Self {
            flow,
            session,
            listen,
            registry,
        }
    }

    /// Per-user groups and sinks, for introspection.
    pub fn registry(&self) -> &Arc<UserRegistry> {
        &self.registry
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr, NodeError> {
        let listener = TcpListener::bind(self.listen).await?;
        let addr = listener.local_addr()?;
        info!("server: listening on {addr}");

        let flow = self.flow.clone();
        let session = self.session.clone();
        let registry = self.registry.clone();
        self.flow.add_task(tokio::spawn(async move {
            accept_loop(listener, flow, session, registry).await;
        }));

        Ok(addr)
    }

    pub fn close(&self) {
        self.flow.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    flow: Flow,
    session: Session,
    registry: Arc<UserRegistry>,
) {
    loop {
        let stream = tokio::select! {
            _ = flow.closed() => {
                debug!("server: accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("server: accepted connection from {peer}");
                    stream
                }
                Err(e) => {
                    warn!("server: accept error: {e}");
                    continue;
                }
            }
        };

        let channel = Channel::server(&flow, session.clone(), stream, registry.clone());
        channel.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    use braid_core::Packet;

    #[tokio::test]
    async fn accepted_connection_registers_its_user() {
        crate::logging::init_for_tests();

        let root = Flow::new();
        let server = BraidServer::new(
            &root,
            Session::new([0x44; 32], 1000),
            "127.0.0.1:0".parse().unwrap(),
        );
        let addr = server.start().await.unwrap();

        // Dial a real client channel; its first frame initializes the user.
        let stream = TcpStream::connect(addr).await.unwrap();
        let (sink, _rx) = mpsc::channel::<Vec<Packet>>(4);
        let client = Channel::client(&root, Session::new([0x44; 32], 7), stream, sink);
        client.run();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while server.registry().user_count() == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "user never registered"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let users = server.registry().users();
        assert_eq!(users[0].0, 7);

        // The channel joined that user's group.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while users[0].1.channel_count() == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "channel never joined the user group"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        root.close();
    }
}
