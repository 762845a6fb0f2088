//! src/admin.rs
//!
//! Defines the `AdminServer` service: a line-oriented TCP channel for
//! inspecting the node and injecting test faults. The server only translates
//! lines into engine requests; all validation and state changes happen in
//! the engine.

use crate::domain::PeerView;
use crate::error::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A parsed administrative command, ready for the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum AdminCommand {
    Peers,
    Current,
    Set { index: usize, word: String },
    Consensus { index: usize },
    Lie { probability: f64 },
    Truth,
}

/// One admin request with its reply slot.
#[derive(Debug)]
pub struct AdminRequest {
    pub command: AdminCommand,
    pub reply: oneshot::Sender<AdminResponse>,
}

/// Response records, one JSON object per request.
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum AdminResponse {
    Peers { peers: HashMap<String, PeerView> },
    Current { words: Vec<String> },
    Set { status: &'static str },
    Consensus { status: &'static str },
    Lie { status: &'static str },
    Truth { status: &'static str },
    Exit { status: &'static str },
    Error { message: String },
}

impl AdminResponse {
    pub fn consensus_started() -> Self {
        AdminResponse::Consensus { status: "started" }
    }

    pub fn error(e: impl std::fmt::Display) -> Self {
        AdminResponse::Error {
            message: e.to_string(),
        }
    }
}

/// The administrative listener actor.
pub struct AdminServer {
    listener: TcpListener,
    request_tx: mpsc::Sender<AdminRequest>,
}

impl AdminServer {
    /// Binds the admin listener. Port 0 selects an ephemeral port.
    pub fn new(port: u16, request_tx: mpsc::Sender<AdminRequest>) -> Result<Self> {
        let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = std::net::TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        Ok(Self { listener, request_tx })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn run(self, shutdown_token: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!(listen_addr = %addr, "Admin server listening"),
            Err(e) => tracing::warn!(error = %e, "Admin listener address unavailable"),
        }

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Admin server received shutdown signal.");
                    break;
                },
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            tracing::debug!(client = %addr, "Admin client connected");
                            let request_tx = self.request_tx.clone();
                            let token = shutdown_token.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, addr, request_tx, token).await;
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "Admin accept failed"),
                    }
                }
            }
        }
    }
}

/// Serves one admin client until EOF, `exit`, or shutdown.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    request_tx: mpsc::Sender<AdminRequest>,
    shutdown_token: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown_token.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            // EOF: the client half-closed; deregister by dropping the stream.
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(client = %addr, error = %e, "Admin read failed");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "exit" {
            let farewell = AdminResponse::Exit { status: "closing" };
            let _ = write_record(&mut writer, &farewell).await;
            break;
        }

        let response = match parse_command(line) {
            Ok(command) => {
                let (tx, rx) = oneshot::channel();
                let request = AdminRequest { command, reply: tx };
                if request_tx.send(request).await.is_err() {
                    break;
                }
                match rx.await {
                    Ok(response) => response,
                    Err(_) => break,
                }
            }
            Err(message) => AdminResponse::Error { message },
        };

        if let Err(e) = write_record(&mut writer, &response).await {
            tracing::debug!(client = %addr, error = %e, "Admin write failed");
            break;
        }
    }

    tracing::debug!(client = %addr, "Admin client disconnected");
}

async fn write_record<W>(writer: &mut W, response: &AdminResponse) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut record = serde_json::to_vec(response)?;
    record.push(b'\n');
    writer.write_all(&record).await
}

/// Translates one request line. Index bounds are the engine's concern; this
/// only deals in shape.
fn parse_command(line: &str) -> std::result::Result<AdminCommand, String> {
    let mut parts = line.split_whitespace();
    let command = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("peers"), None, ..) => AdminCommand::Peers,
        (Some("current"), None, ..) => AdminCommand::Current,
        (Some("set"), Some(index), Some(word), None) => AdminCommand::Set {
            index: parse_index(index)?,
            word: word.to_string(),
        },
        (Some("consensus"), Some(index), None, ..) => AdminCommand::Consensus {
            index: parse_index(index)?,
        },
        (Some("lie"), probability, None, ..) => AdminCommand::Lie {
            probability: match probability {
                Some(p) => p
                    .parse()
                    .map_err(|_| format!("Invalid probability: {p}"))?,
                None => 1.0,
            },
        },
        (Some("truth"), None, ..) => AdminCommand::Truth,
        _ => return Err("Unknown command".to_string()),
    };
    Ok(command)
}

fn parse_index(raw: &str) -> std::result::Result<usize, String> {
    raw.parse().map_err(|_| format!("Invalid index: {raw}"))
}
