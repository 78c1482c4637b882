//! Node orchestration for the braid multipath dispatch group.
//!
//! Ties the transport layer to a runnable process: configuration, logging,
//! the server accept loop, the client dialer, the per-user registry, and
//! the administrative shell.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod server;
#[cfg(unix)]
pub mod shell;
pub mod users;

pub use client::BraidClient;
pub use config::NodeConfig;
pub use error::NodeError;
pub use server::BraidServer;
pub use users::UserRegistry;
