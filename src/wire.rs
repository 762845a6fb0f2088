//! src/wire.rs
//!
//! The peer wire codec: self-describing JSON records keyed by a `command`
//! tag. Decoding is permissive about unknown fields so newer peers can add
//! data without breaking older nodes; unknown tags fail to decode and are
//! dropped by the caller.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum size of a single peer datagram. Receivers read into a buffer of
/// this size, so anything larger truncates and fails to decode.
pub const MAX_DATAGRAM: usize = 1024;

/// A message exchanged between peers over UDP.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum WireMessage {
    #[serde(rename = "GOSSIP")]
    Gossip {
        host: String,
        port: u16,
        name: String,
        #[serde(rename = "messageID")]
        message_id: Uuid,
    },
    #[serde(rename = "GOSSIP_REPLY")]
    GossipReply { host: String, port: u16, name: String },
    #[serde(rename = "CONSENSUS")]
    Consensus {
        host: String,
        port: u16,
        index: usize,
        value: String,
        #[serde(rename = "OM")]
        om: u8,
        peers: Vec<String>,
        #[serde(rename = "messageID")]
        message_id: Uuid,
        /// Unix timestamp (seconds) by which replies must arrive.
        due: u64,
    },
    #[serde(rename = "CONSENSUS-REPLY")]
    ConsensusReply {
        value: String,
        #[serde(rename = "reply-to")]
        reply_to: Uuid,
    },
    #[serde(rename = "QUERY")]
    Query { host: String, port: u16 },
    #[serde(rename = "QUERY-REPLY")]
    QueryReply { database: Vec<String> },
}

impl WireMessage {
    /// Encodes the message for transmission.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a received datagram. Invalid UTF-8 is replaced rather than
    /// rejected; strings on the wire are byte-opaque.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(bytes);
        Ok(serde_json::from_str(&text)?)
    }
}
