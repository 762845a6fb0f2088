//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode wire message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Word index {0} is out of range")]
    IndexOutOfRange(usize),

    #[error("Malformed peer key: {0:?}")]
    MalformedPeerKey(String),
}
