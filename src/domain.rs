//! src/domain.rs
//!
//! Consolidates the node's core data structures: its advertised identity,
//! the soft-state peer table, the shared word vector, the gossip duplicate
//! cache, and the lying policy used for fault injection. This module is the
//! single source of truth for the application's domain model.

use crate::error::{Error, Result};
use rand::{seq::SliceRandom, thread_rng, Rng};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Number of slots in the shared word vector.
pub const WORD_COUNT: usize = 5;

/// Sentinel value substituted for truthful replies while lying is enabled.
pub const LIE_SENTINEL: &str = "LIE";

// --- Identity ---

/// The identity this node advertises to peers.
#[derive(Clone, Debug)]
pub struct NodeIdentity {
    pub host: String,
    pub peer_port: u16,
    pub name: String,
}

impl NodeIdentity {
    /// The `host:port` key under which other nodes would record us.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.peer_port)
    }
}

// --- Peers ---

/// A single membership entry, kept alive by gossip contact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub expiry: Instant,
}

impl Peer {
    pub fn new(host: String, port: u16, name: String, expiry: Instant) -> Self {
        Self { host, port, name, expiry }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Serializable view of a peer for administrative responses.
#[derive(Debug, Serialize)]
pub struct PeerView {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub expires_in_secs: u64,
}

/// The gossip membership set, keyed by `host:port`.
///
/// The table never contains the local node, even when our own announcements
/// loop back to us.
#[derive(Debug)]
pub struct PeerTable {
    local_key: String,
    ttl: Duration,
    peers: HashMap<String, Peer>,
}

impl PeerTable {
    pub fn new(local_key: String, ttl: Duration) -> Self {
        Self {
            local_key,
            ttl,
            peers: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True iff `key` names this node itself.
    pub fn is_self(&self, key: &str) -> bool {
        key == self.local_key
    }

    pub fn contains(&self, key: &str) -> bool {
        self.peers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Inserts a newly discovered peer. Returns false (and stores nothing)
    /// for the local key or an already-known key.
    pub fn insert(&mut self, peer: Peer, now: Instant) -> bool {
        let key = peer.key();
        if self.is_self(&key) || self.peers.contains_key(&key) {
            return false;
        }
        let mut peer = peer;
        peer.expiry = now + self.ttl;
        self.peers.insert(key, peer);
        true
    }

    /// Pushes an existing peer's expiry out to `now + TTL`. Expiry never
    /// moves backwards between renewals.
    pub fn renew(&mut self, key: &str, now: Instant) -> bool {
        match self.peers.get_mut(key) {
            Some(peer) => {
                let renewed = now + self.ttl;
                if renewed > peer.expiry {
                    peer.expiry = renewed;
                }
                true
            }
            None => false,
        }
    }

    /// Removes every entry whose expiry has passed, returning their keys.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.expiry < now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.peers.remove(key);
        }
        expired
    }

    /// Returns up to `k` distinct peers, uniformly at random.
    pub fn sample(&self, k: usize) -> Vec<Peer> {
        let mut rng = thread_rng();
        self.peers
            .values()
            .collect::<Vec<_>>()
            .choose_multiple(&mut rng, k)
            .map(|peer| (*peer).clone())
            .collect()
    }

    /// All table keys, for consensus participant sets.
    pub fn keys(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<&Peer> {
        self.peers.get(key)
    }

    /// Admin-facing snapshot of the table.
    pub fn views(&self, now: Instant) -> HashMap<String, PeerView> {
        self.peers
            .iter()
            .map(|(key, peer)| {
                let view = PeerView {
                    host: peer.host.clone(),
                    port: peer.port,
                    name: peer.name.clone(),
                    expires_in_secs: peer.expiry.saturating_duration_since(now).as_secs(),
                };
                (key.clone(), view)
            })
            .collect()
    }
}

/// Splits a `host:port` key into its parts. The port is the suffix after the
/// last colon, so bare IPv4 addresses and hostnames both work.
pub fn split_peer_key(key: &str) -> Result<(String, u16)> {
    let (host, port) = key
        .rsplit_once(':')
        .ok_or_else(|| Error::MalformedPeerKey(key.to_string()))?;
    let port = port
        .parse()
        .map_err(|_| Error::MalformedPeerKey(key.to_string()))?;
    Ok((host.to_string(), port))
}

// --- Word vector ---

/// The fixed-length shared state consensus operates over. Slots are only
/// ever overwritten; the length never changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WordVector {
    words: [String; WORD_COUNT],
}

impl WordVector {
    pub fn get(&self, index: usize) -> Result<&str> {
        self.words
            .get(index)
            .map(String::as_str)
            .ok_or(Error::IndexOutOfRange(index))
    }

    pub fn set(&mut self, index: usize, word: String) -> Result<()> {
        match self.words.get_mut(index) {
            Some(slot) => {
                *slot = word;
                Ok(())
            }
            None => Err(Error::IndexOutOfRange(index)),
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.words.to_vec()
    }
}

// --- Lying policy ---

/// Fault injection: while enabled, outbound consensus replies are corrupted
/// with the configured probability. Applied only at the reply boundary.
#[derive(Clone, Debug, Default)]
pub struct LiePolicy {
    enabled: bool,
    probability: f64,
}

impl LiePolicy {
    pub fn enable(&mut self, probability: f64) {
        self.enabled = true;
        self.probability = probability.clamp(0.0, 1.0);
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.probability = 0.0;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Passes a truthful reply value through the policy, corrupting it with
    /// the configured probability.
    pub fn apply(&self, value: String) -> String {
        if self.enabled && thread_rng().gen_bool(self.probability) {
            LIE_SENTINEL.to_string()
        } else {
            value
        }
    }
}

// --- Gossip duplicate suppression ---

/// Remembers the most recently seen gossip message IDs, bounded so a
/// long-lived node cannot grow without limit.
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Records an ID. Returns false if it was already present.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

// --- Unit Tests ---
