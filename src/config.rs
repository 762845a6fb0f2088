//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// The four canonical bootstrap hosts, reachable on the canonical peer port.
pub const WELL_KNOWN_HOSTS: [&str; 4] = [
    "owl.cs.umanitoba.ca",
    "eagle.cs.umanitoba.ca",
    "hawk.cs.umanitoba.ca",
    "osprey.cs.umanitoba.ca",
];

/// Peer port used by the well-known hosts, and the port that selects the
/// canonical bindings when passed on the command line.
pub const CANONICAL_PEER_PORT: u16 = 16000;

/// Admin port paired with the canonical peer port.
pub const CANONICAL_ADMIN_PORT: u16 = 15000;

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Hostname advertised to peers in gossip and consensus messages.
    pub host: String,
    /// Name advertised alongside the host in gossip announcements.
    pub node_name: String,
    /// UDP port for peer traffic. 0 binds an ephemeral port.
    pub peer_port: u16,
    /// TCP port for the administrative channel. 0 binds an ephemeral port.
    pub admin_port: u16,
    /// `host:port` entries seeded into the peer table at startup.
    pub bootstrap_peers: Vec<String>,
    pub gossip_interval_ms: u64,
    /// Maximum number of peers announced to per gossip burst.
    pub gossip_fanout: usize,
    pub peer_ttl_ms: u64,
    /// How long a consensus round waits for replies before deciding.
    pub consensus_timeout_ms: u64,
    /// OM recursion depth for initiated rounds. Tolerates `om_level` faulty
    /// peers out of at least `3 * om_level + 1` participants; clamped to
    /// `peers - 1` when the membership is smaller.
    pub om_level: u8,
}

impl Config {
    /// Loads configuration from `config.toml` and environment variables.
    /// It uses the `Default` implementation as a base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("OMNODE_"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            node_name: "node".to_string(),
            peer_port: 0,
            admin_port: 0,
            bootstrap_peers: WELL_KNOWN_HOSTS
                .iter()
                .map(|h| format!("{h}:{CANONICAL_PEER_PORT}"))
                .collect(),
            gossip_interval_ms: 60_000,
            gossip_fanout: 5,
            peer_ttl_ms: 120_000,
            consensus_timeout_ms: 30_000,
            om_level: 1,
        }
    }
}
