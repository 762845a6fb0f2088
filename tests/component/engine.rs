//! tests/component/engine.rs
//!
//! In-memory component tests for the `Engine` actor, driven through the
//! same channels the transport and admin services use in production.

use consensus_network::{
    admin::{AdminCommand, AdminRequest, AdminResponse},
    config::Config,
    domain::NodeIdentity,
    engine::Engine,
    transport::{InboundMessage, TransportCommand},
    wire::WireMessage,
};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use test_log::test;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const LOCAL_HOST: &str = "127.0.0.1";
const LOCAL_PEER_PORT: u16 = 36000;

struct EngineHarness {
    inbound_tx: mpsc::Sender<InboundMessage>,
    admin_tx: mpsc::Sender<AdminRequest>,
    transport_rx: mpsc::Receiver<TransportCommand>,
    shutdown_token: CancellationToken,
}

impl Drop for EngineHarness {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

fn test_config() -> Config {
    Config {
        host: LOCAL_HOST.to_string(),
        node_name: "local".to_string(),
        peer_port: LOCAL_PEER_PORT,
        admin_port: 0,
        // Tests seed membership explicitly.
        bootstrap_peers: Vec::new(),
        gossip_interval_ms: 60_000,
        gossip_fanout: 5,
        peer_ttl_ms: 120_000,
        consensus_timeout_ms: 60_000,
        om_level: 1,
    }
}

fn setup_engine(config: Config) -> EngineHarness {
    let identity = NodeIdentity {
        host: config.host.clone(),
        peer_port: config.peer_port,
        name: config.node_name.clone(),
    };

    let (transport_tx, transport_rx) = mpsc::channel(100);
    let (inbound_tx, inbound_rx) = mpsc::channel(100);
    let (admin_tx, admin_rx) = mpsc::channel(16);

    let engine = Engine::new(identity, config, inbound_rx, admin_rx, transport_tx);

    let shutdown_token = CancellationToken::new();
    tokio::spawn(engine.run(shutdown_token.clone()));

    EngineHarness {
        inbound_tx,
        admin_tx,
        transport_rx,
        shutdown_token,
    }
}

async fn admin(harness: &EngineHarness, command: AdminCommand) -> AdminResponse {
    let (tx, rx) = oneshot::channel();
    harness
        .admin_tx
        .send(AdminRequest { command, reply: tx })
        .await
        .expect("engine gone");
    tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("admin response timed out")
        .expect("admin reply dropped")
}

async fn current_words(harness: &EngineHarness) -> Vec<String> {
    match admin(harness, AdminCommand::Current).await {
        AdminResponse::Current { words } => words,
        other => panic!("expected current response, got {other:?}"),
    }
}

async fn deliver(harness: &EngineHarness, message: WireMessage) {
    let peer_addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    harness
        .inbound_tx
        .send(InboundMessage { peer_addr, message })
        .await
        .expect("engine gone");
}

async fn next_send(harness: &mut EngineHarness) -> (String, u16, WireMessage) {
    let command = tokio::time::timeout(Duration::from_secs(1), harness.transport_rx.recv())
        .await
        .expect("expected an outbound message")
        .expect("transport channel closed");
    let TransportCommand::Send { host, port, message } = command;
    (host, port, message)
}

async fn expect_quiet(harness: &mut EngineHarness) {
    let outcome = tokio::time::timeout(Duration::from_millis(150), harness.transport_rx.recv()).await;
    assert!(outcome.is_err(), "expected no outbound traffic, got {outcome:?}");
}

/// Seeds a peer without provoking an outbound reply.
fn seed_peer(port: u16) -> WireMessage {
    WireMessage::GossipReply {
        host: LOCAL_HOST.to_string(),
        port,
        name: "seed".to_string(),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

// --- Gossip ---

#[test(tokio::test)]
async fn test_first_gossip_contact_adds_peer_and_replies_once() {
    let mut harness = setup_engine(test_config());

    let gossip = WireMessage::Gossip {
        host: LOCAL_HOST.to_string(),
        port: 40001,
        name: "peer".to_string(),
        message_id: Uuid::new_v4(),
    };
    deliver(&harness, gossip.clone()).await;

    let (host, port, message) = next_send(&mut harness).await;
    assert_eq!((host.as_str(), port), (LOCAL_HOST, 40001));
    assert!(
        matches!(message, WireMessage::GossipReply { port: LOCAL_PEER_PORT, .. }),
        "reply must carry the local identity, got {message:?}"
    );

    // Redelivery of the same announcement is suppressed entirely.
    deliver(&harness, gossip).await;
    expect_quiet(&mut harness).await;

    // A fresh announcement from a known peer renews without replying.
    deliver(
        &harness,
        WireMessage::Gossip {
            host: LOCAL_HOST.to_string(),
            port: 40001,
            name: "peer".to_string(),
            message_id: Uuid::new_v4(),
        },
    )
    .await;
    expect_quiet(&mut harness).await;

    match admin(&harness, AdminCommand::Peers).await {
        AdminResponse::Peers { peers } => {
            assert_eq!(peers.len(), 1);
            assert!(peers.contains_key("127.0.0.1:40001"));
        }
        other => panic!("expected peers response, got {other:?}"),
    }
}

#[test(tokio::test)]
async fn test_own_announcements_never_enter_peer_table() {
    let mut harness = setup_engine(test_config());

    deliver(
        &harness,
        WireMessage::Gossip {
            host: LOCAL_HOST.to_string(),
            port: LOCAL_PEER_PORT,
            name: "local".to_string(),
            message_id: Uuid::new_v4(),
        },
    )
    .await;
    deliver(
        &harness,
        WireMessage::GossipReply {
            host: LOCAL_HOST.to_string(),
            port: LOCAL_PEER_PORT,
            name: "local".to_string(),
        },
    )
    .await;
    expect_quiet(&mut harness).await;

    match admin(&harness, AdminCommand::Peers).await {
        AdminResponse::Peers { peers } => assert!(peers.is_empty()),
        other => panic!("expected peers response, got {other:?}"),
    }
}

#[test(tokio::test)]
async fn test_peer_expires_without_renewal_and_survives_with_it() {
    let mut config = test_config();
    config.peer_ttl_ms = 500;
    let harness = setup_engine(config);

    deliver(&harness, seed_peer(40002)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Renew midway through the TTL.
    deliver(&harness, seed_peer(40002)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // 600ms after insert but only 300ms after renewal: still present.
    match admin(&harness, AdminCommand::Peers).await {
        AdminResponse::Peers { peers } => assert!(peers.contains_key("127.0.0.1:40002")),
        other => panic!("expected peers response, got {other:?}"),
    }

    // Past the renewed expiry the sweep removes it.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        match admin(&harness, AdminCommand::Peers).await {
            AdminResponse::Peers { peers } if peers.is_empty() => break,
            _ if tokio::time::Instant::now() > deadline => panic!("peer never expired"),
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

#[test(tokio::test)]
async fn test_gossip_burst_covers_small_membership_exactly() {
    let mut config = test_config();
    config.gossip_interval_ms = 300;
    let mut harness = setup_engine(config);

    for port in [40011, 40012, 40013] {
        deliver(&harness, seed_peer(port)).await;
    }

    // First burst: one announcement per known peer, since the membership is
    // below the fanout bound.
    let mut targets = Vec::new();
    for _ in 0..3 {
        let (_, port, message) = next_send(&mut harness).await;
        assert!(
            matches!(message, WireMessage::Gossip { port: LOCAL_PEER_PORT, .. }),
            "burst must announce the local identity, got {message:?}"
        );
        targets.push(port);
    }
    targets.sort_unstable();
    assert_eq!(targets, vec![40011, 40012, 40013]);

    // Nothing further until the next interval.
    let extra =
        tokio::time::timeout(Duration::from_millis(100), harness.transport_rx.recv()).await;
    assert!(extra.is_err(), "burst exceeded membership size: {extra:?}");
}

// --- Consensus ---

#[test(tokio::test)]
async fn test_om0_reply_is_truthful_and_lying_corrupts_it() {
    let mut harness = setup_engine(test_config());
    admin(
        &harness,
        AdminCommand::Set { index: 1, word: "apple".to_string() },
    )
    .await;

    let ask = |id: Uuid| WireMessage::Consensus {
        host: LOCAL_HOST.to_string(),
        port: 40010,
        index: 1,
        value: "banana".to_string(),
        om: 0,
        peers: Vec::new(),
        message_id: id,
        due: unix_now() + 30,
    };

    let round = Uuid::new_v4();
    deliver(&harness, ask(round)).await;
    let (_, port, message) = next_send(&mut harness).await;
    assert_eq!(port, 40010);
    assert_eq!(
        message,
        WireMessage::ConsensusReply { value: "apple".to_string(), reply_to: round }
    );

    // The reply reflects our own word, not the proposer's value, and is
    // corrupted only while lying is enabled.
    admin(&harness, AdminCommand::Lie { probability: 1.0 }).await;
    let lied = Uuid::new_v4();
    deliver(&harness, ask(lied)).await;
    let (_, _, message) = next_send(&mut harness).await;
    assert_eq!(
        message,
        WireMessage::ConsensusReply { value: "LIE".to_string(), reply_to: lied }
    );

    admin(&harness, AdminCommand::Truth).await;
    let truthful = Uuid::new_v4();
    deliver(&harness, ask(truthful)).await;
    let (_, _, message) = next_send(&mut harness).await;
    assert_eq!(
        message,
        WireMessage::ConsensusReply { value: "apple".to_string(), reply_to: truthful }
    );
}

#[test(tokio::test)]
async fn test_initiated_round_commits_plurality_of_replies() {
    let mut harness = setup_engine(test_config());
    deliver(&harness, seed_peer(40021)).await;
    deliver(&harness, seed_peer(40022)).await;
    admin(
        &harness,
        AdminCommand::Set { index: 0, word: "apple".to_string() },
    )
    .await;

    let response = admin(&harness, AdminCommand::Consensus { index: 0 }).await;
    assert!(matches!(response, AdminResponse::Consensus { status: "started" }));

    // One request per participant, carrying the full participant set.
    let mut round_id = None;
    for _ in 0..2 {
        let (_, _, message) = next_send(&mut harness).await;
        match message {
            WireMessage::Consensus { value, om, peers, message_id, .. } => {
                assert_eq!(value, "apple");
                assert_eq!(om, 1);
                assert_eq!(peers.len(), 2);
                round_id = Some(message_id);
            }
            other => panic!("expected consensus request, got {other:?}"),
        }
    }
    let round_id = round_id.unwrap();

    // Both peers vote banana; the round commits the plurality over our own
    // proposal.
    for _ in 0..2 {
        deliver(
            &harness,
            WireMessage::ConsensusReply { value: "banana".to_string(), reply_to: round_id },
        )
        .await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if current_words(&harness).await[0] == "banana" {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "round never committed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test(tokio::test)]
async fn test_round_decides_once_and_drops_late_replies() {
    let mut config = test_config();
    config.consensus_timeout_ms = 200;
    let mut harness = setup_engine(config);
    deliver(&harness, seed_peer(40023)).await;
    deliver(&harness, seed_peer(40024)).await;
    admin(
        &harness,
        AdminCommand::Set { index: 0, word: "apple".to_string() },
    )
    .await;

    admin(&harness, AdminCommand::Consensus { index: 0 }).await;
    let (_, _, message) = next_send(&mut harness).await;
    let round_id = match message {
        WireMessage::Consensus { message_id, .. } => message_id,
        other => panic!("expected consensus request, got {other:?}"),
    };
    let _ = next_send(&mut harness).await;

    // Only one of the two peers answers before the deadline.
    deliver(
        &harness,
        WireMessage::ConsensusReply { value: "banana".to_string(), reply_to: round_id },
    )
    .await;
    // The word must not change before the round decides.
    assert_eq!(current_words(&harness).await[0], "apple");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(current_words(&harness).await[0], "banana");

    // A straggler after the decision changes nothing.
    deliver(
        &harness,
        WireMessage::ConsensusReply { value: "cherry".to_string(), reply_to: round_id },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(current_words(&harness).await[0], "banana");
}

#[test(tokio::test)]
async fn test_round_with_no_replies_leaves_word_unchanged() {
    let mut config = test_config();
    config.consensus_timeout_ms = 150;
    let mut harness = setup_engine(config);
    deliver(&harness, seed_peer(40025)).await;
    admin(
        &harness,
        AdminCommand::Set { index: 2, word: "keep".to_string() },
    )
    .await;

    admin(&harness, AdminCommand::Consensus { index: 2 }).await;
    let _ = next_send(&mut harness).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(current_words(&harness).await[2], "keep");
}

#[test(tokio::test)]
async fn test_relay_round_commits_and_answers_the_sender() {
    let mut harness = setup_engine(test_config());
    admin(
        &harness,
        AdminCommand::Set { index: 0, word: "banana".to_string() },
    )
    .await;

    let parent = Uuid::new_v4();
    let participants = vec![
        format!("{LOCAL_HOST}:{LOCAL_PEER_PORT}"),
        "127.0.0.1:40031".to_string(),
    ];
    let request = WireMessage::Consensus {
        host: LOCAL_HOST.to_string(),
        port: 40030,
        index: 0,
        value: "apple".to_string(),
        om: 1,
        peers: participants,
        message_id: parent,
        due: unix_now() + 30,
    };
    deliver(&harness, request.clone()).await;

    // The request is relayed one level down, to everyone but ourselves.
    let (_, port, relayed) = next_send(&mut harness).await;
    assert_eq!(port, 40031);
    let sub_id = match relayed {
        WireMessage::Consensus { om, value, peers, message_id, .. } => {
            assert_eq!(om, 0);
            assert_eq!(value, "apple");
            assert_eq!(peers, vec!["127.0.0.1:40031".to_string()]);
            message_id
        }
        other => panic!("expected relayed consensus request, got {other:?}"),
    };

    // A duplicate of the inbound request must not spawn a second sub-round.
    deliver(&harness, request).await;
    expect_quiet(&mut harness).await;

    // A lone liar cannot outvote the sender's value.
    deliver(
        &harness,
        WireMessage::ConsensusReply { value: "LIE".to_string(), reply_to: sub_id },
    )
    .await;

    let (_, port, reply) = next_send(&mut harness).await;
    assert_eq!(port, 40030);
    assert_eq!(
        reply,
        WireMessage::ConsensusReply { value: "apple".to_string(), reply_to: parent }
    );

    // The relaying participant converges on its decision too.
    assert_eq!(current_words(&harness).await[0], "apple");
}

// --- Admin and queries ---

#[test(tokio::test)]
async fn test_admin_set_current_roundtrip() {
    let harness = setup_engine(test_config());

    let response = admin(
        &harness,
        AdminCommand::Set { index: 2, word: "x".to_string() },
    )
    .await;
    assert!(matches!(response, AdminResponse::Set { status: "done" }));

    assert_eq!(current_words(&harness).await, vec!["", "", "x", "", ""]);

    let response = admin(
        &harness,
        AdminCommand::Set { index: 9, word: "y".to_string() },
    )
    .await;
    assert!(matches!(response, AdminResponse::Error { .. }));
    assert_eq!(current_words(&harness).await, vec!["", "", "x", "", ""]);
}

#[test(tokio::test)]
async fn test_query_returns_the_database() {
    let mut harness = setup_engine(test_config());
    admin(
        &harness,
        AdminCommand::Set { index: 4, word: "zed".to_string() },
    )
    .await;

    deliver(
        &harness,
        WireMessage::Query { host: LOCAL_HOST.to_string(), port: 40040 },
    )
    .await;

    let (_, port, message) = next_send(&mut harness).await;
    assert_eq!(port, 40040);
    assert_eq!(
        message,
        WireMessage::QueryReply {
            database: vec![
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                "zed".to_string(),
            ]
        }
    );
}
