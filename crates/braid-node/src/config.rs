//! TOML-based configuration for braid nodes.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use braid_core::session::Session;

use crate::error::NodeError;

/// Top-level node configuration loaded from a TOML file.
///
/// A node runs a server endpoint, a client endpoint, or both, depending on
/// which sections are present.
#[derive(Debug, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    pub server: Option<ServerSection>,
    pub client: Option<ClientSection>,
    #[serde(default)]
    pub shell: ShellSection,
}

/// The `[node]` section: shared identity.
#[derive(Debug, Deserialize)]
pub struct NodeSection {
    /// Shared session secret, 64 hex characters.
    #[serde(default)]
    pub secret: String,
    /// User id this endpoint stamps outbound frames with.
    #[serde(default = "default_user_id")]
    pub user_id: u32,
}

fn default_user_id() -> u32 {
    1
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            secret: String::new(),
            user_id: default_user_id(),
        }
    }
}

/// The `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Address the accept loop binds to.
    pub listen: SocketAddr,
}

/// The `[client]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    /// Server addresses to dial. Several addresses model several network
    /// paths to the same endpoint.
    pub peers: Vec<String>,
    /// Channels to keep open per peer address.
    #[serde(default = "default_channels_per_peer")]
    pub channels_per_peer: usize,
}

fn default_channels_per_peer() -> usize {
    2
}

/// The `[shell]` section.
#[derive(Debug, Default, Deserialize)]
pub struct ShellSection {
    /// Unix socket path for the administrative shell; absent disables it.
    pub socket: Option<PathBuf>,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("failed to read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))
    }

    /// Decode the shared secret into key bytes.
    pub fn secret(&self) -> Result<[u8; 32], NodeError> {
        let raw = hex::decode(&self.node.secret)
            .map_err(|e| NodeError::Secret(format!("not valid hex: {e}")))?;
        <[u8; 32]>::try_from(raw.as_slice())
            .map_err(|_| NodeError::Secret(format!("need 32 bytes, got {}", raw.len())))
    }

    /// Build this endpoint's session from the configured identity.
    pub fn session(&self) -> Result<Session, NodeError> {
        Ok(Session::new(self.secret()?, self.node.user_id))
    }
}
