use std::path::PathBuf;

use clap::Parser;

use braid_node::{BraidClient, BraidServer, NodeConfig};
use braid_transport::Flow;

#[derive(Parser)]
#[command(name = "braid-node", about = "Multipath packet-dispatch node")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "braid.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        braid_node::logging::init_json();
    } else {
        braid_node::logging::init();
    }

    let config = match NodeConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", cli.config.display());
            std::process::exit(1);
        }
    };

    let session = match config.session() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("bad [node] section: {e}");
            std::process::exit(1);
        }
    };

    let root = Flow::new();

    let server = match &config.server {
        Some(section) => {
            let server = BraidServer::new(&root, session.clone(), section.listen);
            if let Err(e) = server.start().await {
                tracing::error!("failed to start server: {e}");
                std::process::exit(1);
            }
            Some(server)
        }
        None => None,
    };

    let client = match &config.client {
        Some(section) => {
            let client = BraidClient::new(&root, session.clone());
            if let Err(e) = client.start(&section.peers, section.channels_per_peer) {
                tracing::error!("failed to start client: {e}");
                std::process::exit(1);
            }
            Some(client)
        }
        None => None,
    };

    if server.is_none() && client.is_none() {
        tracing::error!("config enables neither [server] nor [client]; nothing to do");
        std::process::exit(1);
    }

    #[cfg(unix)]
    if let Some(socket) = config.shell.socket.clone() {
        use braid_node::shell::{Shell, ShellContext};

        let mut ctx = ShellContext::new();
        if let Some(server) = &server {
            ctx = ctx.with_registry(server.registry().clone());
        }
        if let Some(client) = &client {
            ctx = ctx.with_client_group(client.group().clone());
        }

        match Shell::bind(&root, socket, std::sync::Arc::new(ctx)).await {
            Ok(shell) => shell.run(),
            Err(e) => {
                tracing::error!("failed to bind shell: {e}");
                std::process::exit(1);
            }
        }
    }

    // Spawn SIGINT handler
    let handle = root.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received SIGINT, shutting down");
        handle.close();
    });

    // Spawn SIGTERM handler (Docker sends SIGTERM on `docker stop`)
    #[cfg(unix)]
    {
        let handle = root.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            sigterm.recv().await;
            tracing::info!("received SIGTERM, shutting down");
            handle.close();
        });
    }

    root.closed().await;
    root.join_all().await;
}
