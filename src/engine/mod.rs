//! src/engine/mod.rs
//!
//! Defines the `Engine`, the node's reactor. It is the sole owner of all
//! protocol state (peer table, word vector, pending rounds, timers, lying
//! policy) and multiplexes peer traffic, administrative requests, and timed
//! events in one loop.

use crate::{
    admin::{AdminCommand, AdminRequest, AdminResponse},
    config::Config,
    domain::{
        split_peer_key, LiePolicy, NodeIdentity, Peer, PeerTable, SeenCache, WordVector,
        WORD_COUNT,
    },
    transport::{InboundMessage, TransportCommand},
    wire::WireMessage,
};
use self::consensus::{ConsensusState, PendingRound, RoundKind};
use self::events::{EventKind, EventQueue};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod consensus;
pub mod events;

/// Upper bound on remembered gossip message IDs.
const SEEN_CAPACITY: usize = 4096;

/// The reactor actor.
pub struct Engine {
    identity: NodeIdentity,
    gossip_interval: Duration,
    gossip_fanout: usize,
    consensus_timeout: Duration,
    om_level: u8,
    peers: PeerTable,
    words: WordVector,
    lies: LiePolicy,
    seen: SeenCache,
    events: EventQueue,
    rounds: ConsensusState,
    gossip_event: Uuid,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    admin_rx: mpsc::Receiver<AdminRequest>,
    transport_tx: mpsc::Sender<TransportCommand>,
}

impl Engine {
    pub fn new(
        identity: NodeIdentity,
        config: Config,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        admin_rx: mpsc::Receiver<AdminRequest>,
        transport_tx: mpsc::Sender<TransportCommand>,
    ) -> Self {
        let now = Instant::now();
        let ttl = Duration::from_millis(config.peer_ttl_ms);
        let mut peers = PeerTable::new(identity.key(), ttl);
        for entry in &config.bootstrap_peers {
            match split_peer_key(entry) {
                Ok((host, port)) => {
                    peers.insert(Peer::new(host, port, "WK".to_string(), now), now);
                }
                Err(e) => tracing::warn!(entry = %entry, error = %e, "Skipping bootstrap entry"),
            }
        }

        let gossip_interval = Duration::from_millis(config.gossip_interval_ms);
        let mut events = EventQueue::new();
        let gossip_event = events.insert(EventKind::Gossip, now + gossip_interval);

        Self {
            identity,
            gossip_interval,
            gossip_fanout: config.gossip_fanout,
            consensus_timeout: Duration::from_millis(config.consensus_timeout_ms),
            om_level: config.om_level,
            peers,
            words: WordVector::default(),
            lies: LiePolicy::default(),
            seen: SeenCache::new(SEEN_CAPACITY),
            events,
            rounds: ConsensusState::new(),
            gossip_event,
            inbound_rx,
            admin_rx,
            transport_tx,
        }
    }

    pub async fn run(mut self, shutdown_token: CancellationToken) {
        tracing::info!(node = %self.identity.key(), "Engine service started");

        loop {
            // A deadline already in the past wakes the loop immediately, so
            // overdue events never block behind the readiness wait. The
            // gossip event is renewed forever, so the queue is never empty.
            let deadline = self
                .events
                .earliest()
                .expect("gossip event keeps the queue non-empty");

            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Engine service received shutdown signal.");
                    break;
                },
                _ = time::sleep_until(deadline) => {},
                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_peer_message(inbound).await;
                },
                Some(request) = self.admin_rx.recv() => {
                    self.handle_admin_request(request).await;
                },
            }

            let now = Instant::now();
            for key in self.peers.sweep(now) {
                tracing::debug!(peer = %key, "Expired peer removed");
            }
            self.fire_due_events(now).await;
        }
    }

    // --- Timed events ---

    async fn fire_due_events(&mut self, now: Instant) {
        for (id, kind) in self.events.due(now) {
            match kind {
                EventKind::Gossip => {
                    self.gossip_burst().await;
                    self.events.renew(id, now + self.gossip_interval);
                }
                EventKind::ConsensusDue(round_id) => {
                    self.events.remove(id);
                    tracing::debug!(round = %round_id, "Consensus deadline elapsed");
                    self.finalize_round(round_id).await;
                }
            }
        }
    }

    /// Announces this node to a random subset of known peers.
    async fn gossip_burst(&mut self) {
        let sample = self.peers.sample(self.gossip_fanout);
        tracing::debug!(count = sample.len(), "Gossiping to peers");
        for peer in sample {
            let announce = WireMessage::Gossip {
                host: self.identity.host.clone(),
                port: self.identity.peer_port,
                name: self.identity.name.clone(),
                message_id: Uuid::new_v4(),
            };
            self.send(peer.host, peer.port, announce).await;
        }
    }

    // --- Peer traffic ---

    async fn handle_peer_message(&mut self, inbound: InboundMessage) {
        tracing::trace!(from = %inbound.peer_addr, "Peer message received");
        match inbound.message {
            WireMessage::Gossip { host, port, name, message_id } => {
                self.on_gossip(host, port, name, message_id).await;
            }
            WireMessage::GossipReply { host, port, name } => {
                self.on_gossip_reply(host, port, name);
            }
            WireMessage::Consensus { host, port, index, value, om, peers, message_id, due } => {
                self.on_consensus(host, port, index, value, om, peers, message_id, due)
                    .await;
            }
            WireMessage::ConsensusReply { value, reply_to } => {
                self.on_consensus_reply(value, reply_to).await;
            }
            WireMessage::Query { host, port } => {
                let reply = WireMessage::QueryReply {
                    database: self.words.snapshot(),
                };
                self.send(host, port, reply).await;
            }
            WireMessage::QueryReply { .. } => {
                tracing::debug!("Ignoring QUERY-REPLY addressed to a node");
            }
        }
    }

    async fn on_gossip(&mut self, host: String, port: u16, name: String, message_id: Uuid) {
        if !self.seen.insert(message_id) {
            tracing::debug!(id = %message_id, "Duplicate gossip dropped");
            return;
        }

        let key = format!("{host}:{port}");
        if self.peers.is_self(&key) {
            tracing::debug!("Own gossip looped back; dropped");
            return;
        }

        let now = Instant::now();
        if self.peers.contains(&key) {
            self.peers.renew(&key, now);
            tracing::debug!(peer = %key, "Peer renewed");
        } else {
            self.peers.insert(Peer::new(host.clone(), port, name, now), now);
            tracing::info!(peer = %key, "Peer added");
            // First contact: introduce ourselves so discovery becomes
            // bidirectional.
            let reply = WireMessage::GossipReply {
                host: self.identity.host.clone(),
                port: self.identity.peer_port,
                name: self.identity.name.clone(),
            };
            self.send(host, port, reply).await;
        }
    }

    fn on_gossip_reply(&mut self, host: String, port: u16, name: String) {
        let key = format!("{host}:{port}");
        if self.peers.is_self(&key) {
            return;
        }
        let now = Instant::now();
        if self.peers.contains(&key) {
            self.peers.renew(&key, now);
        } else {
            self.peers.insert(Peer::new(host, port, name, now), now);
            tracing::info!(peer = %key, "Peer added via gossip reply");
        }
    }

    // --- Consensus ---

    /// Starts an OM round over `words[index]` across the current membership.
    async fn initiate_round(&mut self, index: usize) -> AdminResponse {
        let value = match self.words.get(index) {
            Ok(value) => value.to_string(),
            Err(e) => return AdminResponse::error(e),
        };

        let participants = self.peers.keys();
        if participants.is_empty() {
            tracing::debug!(index, "No peers; consensus round is a no-op");
            return AdminResponse::consensus_started();
        }

        let om = self
            .om_level
            .min(u8::try_from(participants.len() - 1).unwrap_or(u8::MAX));
        let message_id = Uuid::new_v4();
        let due = unix_now() + self.consensus_timeout.as_secs();
        let due_event = self.events.insert(
            EventKind::ConsensusDue(message_id),
            Instant::now() + self.consensus_timeout,
        );

        self.rounds.register(
            message_id,
            PendingRound {
                kind: RoundKind::Initiated,
                index,
                proposed: value.clone(),
                expected: participants.len(),
                replies: Vec::new(),
                due_event,
            },
        );

        tracing::info!(round = %message_id, index, om, peers = participants.len(), "Consensus round started");

        for key in &participants {
            if let Some(peer) = self.peers.get(key) {
                let request = WireMessage::Consensus {
                    host: self.identity.host.clone(),
                    port: self.identity.peer_port,
                    index,
                    value: value.clone(),
                    om,
                    peers: participants.clone(),
                    message_id,
                    due,
                };
                let (host, port) = (peer.host.clone(), peer.port);
                self.send(host, port, request).await;
            }
        }

        AdminResponse::consensus_started()
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_consensus(
        &mut self,
        host: String,
        port: u16,
        index: usize,
        value: String,
        om: u8,
        peers: Vec<String>,
        message_id: Uuid,
        due: u64,
    ) {
        if index >= WORD_COUNT {
            tracing::debug!(index, "Consensus request with bad index dropped");
            return;
        }
        if self.rounds.has_relay_for(&message_id) {
            tracing::debug!(id = %message_id, "Duplicate consensus request dropped");
            return;
        }

        if om == 0 {
            // OM(0): answer with our own current word, through the lying
            // policy.
            let own = match self.words.get(index) {
                Ok(word) => word.to_string(),
                Err(_) => return,
            };
            let reply = WireMessage::ConsensusReply {
                value: self.lies.apply(own),
                reply_to: message_id,
            };
            self.send(host, port, reply).await;
            return;
        }

        // OM(m > 0): relay one level down to every other participant and
        // collect their votes until just before the requester's deadline.
        let sub_peers: Vec<String> = peers
            .into_iter()
            .filter(|key| !self.peers.is_self(key))
            .collect();

        let targets: Vec<(String, u16)> = sub_peers
            .iter()
            .filter_map(|key| match split_peer_key(key) {
                Ok(target) => Some(target),
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Unaddressable participant skipped");
                    None
                }
            })
            .collect();

        let sub_id = Uuid::new_v4();
        let sub_due = due.saturating_sub(1);
        let due_event = self
            .events
            .insert(EventKind::ConsensusDue(sub_id), deadline_from_unix(sub_due));

        self.rounds.register(
            sub_id,
            PendingRound {
                kind: RoundKind::Relay {
                    reply_host: host,
                    reply_port: port,
                    parent_id: message_id,
                },
                index,
                proposed: value.clone(),
                expected: targets.len(),
                replies: Vec::new(),
                due_event,
            },
        );

        tracing::debug!(parent = %message_id, sub = %sub_id, om = om - 1, peers = targets.len(), "Relaying consensus round");

        for (target_host, target_port) in targets {
            let request = WireMessage::Consensus {
                host: self.identity.host.clone(),
                port: self.identity.peer_port,
                index,
                value: value.clone(),
                om: om - 1,
                peers: sub_peers.clone(),
                message_id: sub_id,
                due: sub_due,
            };
            self.send(target_host, target_port, request).await;
        }

        // With nobody left to ask, the round is already complete and decides
        // the received value.
        if self.rounds.round(&sub_id).is_some_and(PendingRound::is_complete) {
            self.finalize_round(sub_id).await;
        }
    }

    async fn on_consensus_reply(&mut self, value: String, reply_to: Uuid) {
        if !self.rounds.contains(&reply_to) {
            tracing::debug!(round = %reply_to, "Late or foreign consensus reply dropped");
            return;
        }
        if self.rounds.record_reply(&reply_to, value) {
            self.finalize_round(reply_to).await;
        }
    }

    /// Decides and commits a round. Called once per round, from whichever of
    /// "all replies arrived" or "deadline elapsed" happens first; the loser
    /// finds the round already gone.
    async fn finalize_round(&mut self, round_id: Uuid) {
        let Some(round) = self.rounds.take(&round_id) else {
            return;
        };
        self.events.remove(round.due_event);

        let decision = match round.decision() {
            Some(value) => value,
            None => {
                tracing::info!(round = %round_id, index = round.index, "Round ended with no replies; word unchanged");
                return;
            }
        };

        tracing::info!(round = %round_id, index = round.index, value = %decision, replies = round.replies.len(), "Consensus decided");
        if let Err(e) = self.words.set(round.index, decision.clone()) {
            tracing::warn!(error = %e, "Discarding undecidable commit");
            return;
        }

        if let RoundKind::Relay { reply_host, reply_port, parent_id } = round.kind {
            let reply = WireMessage::ConsensusReply {
                value: self.lies.apply(decision),
                reply_to: parent_id,
            };
            self.send(reply_host, reply_port, reply).await;
        }
    }

    // --- Admin ---

    async fn handle_admin_request(&mut self, request: AdminRequest) {
        let AdminRequest { command, reply } = request;
        let response = match command {
            AdminCommand::Peers => AdminResponse::Peers {
                peers: self.peers.views(Instant::now()),
            },
            AdminCommand::Current => AdminResponse::Current {
                words: self.words.snapshot(),
            },
            AdminCommand::Set { index, word } => match self.words.set(index, word) {
                Ok(()) => AdminResponse::Set { status: "done" },
                Err(e) => AdminResponse::error(e),
            },
            AdminCommand::Consensus { index } => self.initiate_round(index).await,
            AdminCommand::Lie { probability } => {
                self.lies.enable(probability);
                tracing::info!(probability = self.lies.probability(), "Lying enabled");
                AdminResponse::Lie { status: "started" }
            }
            AdminCommand::Truth => {
                self.lies.disable();
                tracing::info!("Lying disabled");
                AdminResponse::Truth { status: "stopped" }
            }
        };
        // The client may have disconnected while we worked; nothing to do.
        let _ = reply.send(response);
    }

    // --- Outbound ---

    async fn send(&self, host: String, port: u16, message: WireMessage) {
        let command = TransportCommand::Send { host, port, message };
        if let Err(e) = self.transport_tx.send(command).await {
            tracing::error!(error = %e, "Failed to send command to transport service");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}

/// Maps a wire deadline (unix seconds) onto the reactor clock. Deadlines
/// already in the past fire on the next loop iteration.
fn deadline_from_unix(due: u64) -> Instant {
    let remaining = due.saturating_sub(unix_now());
    Instant::now() + Duration::from_secs(remaining)
}
