//! Error types for the harvesting node.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while harvesting, storing and synchronizing.
#[derive(Error, Debug)]
pub enum Error {
    /// Core model error (malformed timeline, bad timestamp).
    #[error(transparent)]
    Core(#[from] magpie_core::Error),

    /// Peer HTTP request failed.
    #[error("peer request error: {0}")]
    Peer(#[from] reqwest::Error),

    /// A peer answered with something other than a timeline document.
    #[error("unusable peer response from {peer}: {reason}")]
    PeerResponse {
        /// Peer base URL.
        peer: String,
        /// What was wrong with the response.
        reason: String,
    },

    /// Dump log append or rotation fault.
    #[error("dump log error: {0}")]
    DumpLog(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
