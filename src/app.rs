//! src/app.rs
//!
//! Defines the main `App` struct, which encapsulates the node's state and
//! manages the lifecycle of all its concurrent services.

use crate::{
    admin::{AdminRequest, AdminServer},
    config::Config,
    domain::NodeIdentity,
    engine::Engine,
    error::Result,
    transport::{InboundMessage, Transport, TransportCommand},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Encapsulates the entire application, including its configuration and the
/// lifecycle management of its concurrent services.
pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Token that cancels this app; used by tests to stop a node early.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// The main run loop for the application.
    ///
    /// Binds both sockets first (so ephemeral port assignments are known to
    /// the advertised identity), wires the channels between the services,
    /// spawns each service in its own Tokio task, and waits for a shutdown
    /// signal.
    pub async fn run(self) -> Result<()> {
        // --- Create Communication Channels ---
        let (transport_command_tx, transport_command_rx) = mpsc::channel::<TransportCommand>(100);
        let (inbound_message_tx, inbound_message_rx) = mpsc::channel::<InboundMessage>(100);
        let (admin_request_tx, admin_request_rx) = mpsc::channel::<AdminRequest>(16);

        // --- Bind Sockets, Then Build the Advertised Identity ---
        let transport = Transport::new(
            self.config.peer_port,
            transport_command_rx,
            inbound_message_tx,
        )?;
        let admin = AdminServer::new(self.config.admin_port, admin_request_tx)?;

        let identity = NodeIdentity {
            host: self.config.host.clone(),
            peer_port: transport.local_port()?,
            name: self.config.node_name.clone(),
        };

        tracing::info!(
            node = %identity.key(),
            peer_port = identity.peer_port,
            admin_port = admin.local_port()?,
            "🚀 Starting node..."
        );

        // --- Instantiate and Spawn Services ---
        let transport_task = tokio::spawn(transport.run(self.shutdown_token.clone()));
        tracing::debug!("Transport service spawned.");

        let engine = Engine::new(
            identity,
            self.config.clone(),
            inbound_message_rx,
            admin_request_rx,
            transport_command_tx,
        );
        let engine_task = tokio::spawn(engine.run(self.shutdown_token.clone()));
        tracing::debug!("Engine service spawned.");

        let admin_task = tokio::spawn(admin.run(self.shutdown_token.clone()));
        tracing::debug!("Admin service spawned.");

        // --- Wait for Shutdown Signal ---
        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
            shutdown_token.cancel();
        });

        // --- Await Service Termination ---
        self.shutdown_token.cancelled().await;

        // The tasks will complete once the shutdown token is cancelled.
        // We await them to ensure they finish cleanly.
        if let Err(e) = transport_task.await {
            tracing::error!(error = ?e, "Transport service task failed");
        }
        if let Err(e) = engine_task.await {
            tracing::error!(error = ?e, "Engine service task failed");
        }
        if let Err(e) = admin_task.await {
            tracing::error!(error = ?e, "Admin service task failed");
        }
        tracing::info!("👋 Node has shut down gracefully.");

        Ok(())
    }
}
