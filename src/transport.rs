//! src/transport.rs
//!
//! Defines the `Transport` service, responsible for all peer datagram I/O.
//! Sends are best-effort: the protocol tolerates datagram loss, so failures
//! are logged and dropped.

use crate::{
    error::Result,
    wire::{WireMessage, MAX_DATAGRAM},
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Commands that can be sent to the `Transport` service. Targets are named
/// by advertised `host` and `port`, resolved at send time.
#[derive(Debug)]
pub enum TransportCommand {
    Send {
        host: String,
        port: u16,
        message: WireMessage,
    },
}

/// A decoded message received from a peer, bundled with its source address.
#[derive(Debug)]
pub struct InboundMessage {
    pub peer_addr: SocketAddr,
    pub message: WireMessage,
}

/// The peer datagram transport actor.
pub struct Transport {
    socket: Arc<UdpSocket>,
    command_rx: mpsc::Receiver<TransportCommand>,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl Transport {
    /// Binds the peer socket. Port 0 selects an ephemeral port.
    pub fn new(
        port: u16,
        command_rx: mpsc::Receiver<TransportCommand>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Result<Self> {
        let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        std_socket.set_nonblocking(true)?;

        Ok(Self {
            socket: Arc::new(UdpSocket::from_std(std_socket)?),
            command_rx,
            inbound_tx,
        })
    }

    /// The actual bound peer port, for the node's advertised identity.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// The main run loop for the `Transport` service.
    pub async fn run(mut self, shutdown_token: CancellationToken) {
        match self.socket.local_addr() {
            Ok(addr) => tracing::info!(listen_addr = %addr, "Transport service started"),
            Err(e) => tracing::warn!(error = %e, "Peer socket address unavailable"),
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Transport service received shutdown signal.");
                    break;
                },
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer_addr)) => {
                            self.handle_datagram(&buf[..len], peer_addr).await;
                        }
                        Err(e) => tracing::warn!(error = %e, "Datagram receive failed"),
                    }
                },
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command);
                }
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8], peer_addr: SocketAddr) {
        match WireMessage::decode(bytes) {
            Ok(message) => {
                let inbound = InboundMessage { peer_addr, message };
                if self.inbound_tx.send(inbound).await.is_err() {
                    tracing::warn!("Inbound message channel is closed.");
                }
            }
            Err(e) => {
                tracing::debug!(from = %peer_addr, error = %e, "Dropping undecodable datagram");
            }
        }
    }

    fn handle_command(&self, command: TransportCommand) {
        let TransportCommand::Send { host, port, message } = command;
        let socket = Arc::clone(&self.socket);
        // Name resolution and the send itself run off the transport loop so
        // a slow DNS lookup cannot stall receives.
        tokio::spawn(async move {
            let bytes = match message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode outbound message");
                    return;
                }
            };
            if bytes.len() > MAX_DATAGRAM {
                tracing::warn!(len = bytes.len(), "Outbound message exceeds the datagram limit");
            }
            match socket.send_to(&bytes, (host.as_str(), port)).await {
                Ok(_) => tracing::trace!(peer = %format!("{host}:{port}"), "Sent message"),
                Err(e) => tracing::debug!(peer = %format!("{host}:{port}"), error = %e, "Send failed"),
            }
        });
    }
}
