//! src/engine/consensus.rs
//!
//! Bookkeeping and decision logic for Oral-Messages rounds. The engine actor
//! drives the protocol; this module owns the pending-round table and the
//! plurality rule, so the algorithm can be tested without sockets.

use std::collections::HashMap;
use uuid::Uuid;

/// Why a round exists, and what to do with its decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundKind {
    /// Started locally; the decision is committed to the word vector.
    Initiated,
    /// Relaying an OM(m > 0) request; the decision is committed and also
    /// replied to the requester under `parent_id`.
    Relay {
        reply_host: String,
        reply_port: u16,
        parent_id: Uuid,
    },
}

/// One in-flight OM round, awaiting replies until its deadline.
#[derive(Debug)]
pub struct PendingRound {
    pub kind: RoundKind,
    pub index: usize,
    /// For an initiated round, the value proposed to the cluster; for a
    /// relay, the value received from the sender.
    pub proposed: String,
    /// Number of peers the request was sent to.
    pub expected: usize,
    pub replies: Vec<String>,
    /// Event queue entry holding the round's deadline.
    pub due_event: Uuid,
}

impl PendingRound {
    /// True once every addressed peer has answered.
    pub fn is_complete(&self) -> bool {
        self.replies.len() >= self.expected
    }

    /// The round's decided value, if it decides at all.
    ///
    /// An initiated round with no replies decides nothing, leaving the word
    /// vector untouched. A relay round always decides: the value received
    /// from the sender counts as a vote alongside the collected replies, so
    /// a single liar cannot outvote the sender in a three-node round.
    pub fn decision(&self) -> Option<String> {
        match self.kind {
            RoundKind::Initiated => {
                if self.replies.is_empty() {
                    None
                } else {
                    Some(plurality(&self.proposed, self.replies.iter()))
                }
            }
            RoundKind::Relay { .. } => Some(plurality(
                &self.proposed,
                std::iter::once(&self.proposed).chain(self.replies.iter()),
            )),
        }
    }
}

/// All rounds currently awaiting replies, keyed by their message ID.
#[derive(Debug, Default)]
pub struct ConsensusState {
    rounds: HashMap<Uuid, PendingRound>,
}

impl ConsensusState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, message_id: &Uuid) -> bool {
        self.rounds.contains_key(message_id)
    }

    pub fn register(&mut self, message_id: Uuid, round: PendingRound) {
        self.rounds.insert(message_id, round);
    }

    pub fn round(&self, message_id: &Uuid) -> Option<&PendingRound> {
        self.rounds.get(message_id)
    }

    /// True if an inbound request with this message ID is already being
    /// relayed, so a duplicate datagram does not spawn a second sub-round.
    pub fn has_relay_for(&self, parent: &Uuid) -> bool {
        self.rounds.values().any(|round| {
            matches!(&round.kind, RoundKind::Relay { parent_id, .. } if parent_id == parent)
        })
    }

    /// Records a reply for its round. Returns true when the round is now
    /// fully answered; replies for unknown (completed or foreign) rounds are
    /// ignored and return false.
    pub fn record_reply(&mut self, reply_to: &Uuid, value: String) -> bool {
        match self.rounds.get_mut(reply_to) {
            Some(round) => {
                round.replies.push(value);
                round.is_complete()
            }
            None => false,
        }
    }

    /// Takes a round out of the pending table for finalization. Each round
    /// can be taken at most once, so a deadline firing after an early
    /// completion is harmless.
    pub fn take(&mut self, message_id: &Uuid) -> Option<PendingRound> {
        self.rounds.remove(message_id)
    }
}

/// The most frequent value among `votes`, deterministically tie-broken:
/// a tie goes to `proposed` when it is among the leaders, otherwise to the
/// lexicographically smallest leader. Honest nodes therefore converge, and
/// an injected "LIE" (which sorts before lowercase words) cannot win a tie
/// against the sender's value.
pub fn plurality<'a, I>(proposed: &str, votes: I) -> String
where
    I: Iterator<Item = &'a String>,
{
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for vote in votes {
        *counts.entry(vote.as_str()).or_default() += 1;
    }
    if counts.is_empty() {
        return proposed.to_string();
    }

    let best = counts.values().copied().max().unwrap_or(0);
    let mut leaders: Vec<&str> = counts
        .iter()
        .filter(|(_, count)| **count == best)
        .map(|(value, _)| *value)
        .collect();

    if leaders.contains(&proposed) {
        return proposed.to_string();
    }
    leaders.sort_unstable();
    leaders[0].to_string()
}
