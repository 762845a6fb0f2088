//! src/main.rs
//!
//! Binary entry point. Responsible for initializing tracing, loading
//! configuration, applying the `<peerPort?> [--debug]` command line, and
//! running the main `App`.

use anyhow::Context;
use consensus_network::{
    config::{CANONICAL_ADMIN_PORT, CANONICAL_PEER_PORT},
    App, Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut debug = false;
    let mut peer_port: Option<u16> = None;
    for arg in std::env::args().skip(1) {
        if arg == "--debug" {
            debug = true;
        } else {
            peer_port = Some(arg.parse().with_context(|| format!("Invalid peer port: {arg}"))?);
        }
    }

    // Initialize the tracing subscriber. RUST_LOG takes precedence; the
    // --debug flag only raises the default level.
    let default_filter = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    // Load configuration.
    let mut config = Config::load().context("Failed to load configuration")?;

    // The canonical peer port selects the canonical bindings; any other
    // requested port leaves both sockets ephemeral.
    match peer_port {
        Some(port) if port == CANONICAL_PEER_PORT => {
            config.peer_port = CANONICAL_PEER_PORT;
            config.admin_port = CANONICAL_ADMIN_PORT;
        }
        Some(_) => {
            config.peer_port = 0;
            config.admin_port = 0;
        }
        None => {}
    }

    // Create and run the application.
    if let Err(e) = App::new(config)?.run().await {
        tracing::error!(error = %e, "💥 Application failed");
        std::process::exit(1);
    }

    Ok(())
}
