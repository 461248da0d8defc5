//! Error types for the block subscriber.

use thiserror::Error;

/// Errors that can occur while tracking the chain head.
///
/// Only [`BlockSub::start`](crate::BlockSub::start) hands these to callers. Once
/// running, every failure is recovered internally and only shows up in logs and
/// metrics.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to load or parse configuration.
    #[error("config error: {0}")]
    Config(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON-RPC error returned by the node.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code.
        code: i64,
        /// Error message.
        message: String,
    },

    /// Failed to parse response.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The node answered with a `null` latest block.
    #[error("node returned no latest header")]
    MissingHeader,

    /// WebSocket connection or subscription failed.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml_edit::de::Error),

    /// `start` was called on a block subscriber that is already running.
    #[error("block subscriber already started")]
    AlreadyStarted,

    /// The block subscriber has been stopped and cannot be restarted.
    #[error("block subscriber stopped")]
    Stopped,

    /// The operation was abandoned because shutdown was requested.
    #[error("operation cancelled")]
    Cancelled,

    /// Neither a polling nor a subscription source is configured.
    #[error("no header source configured")]
    NoSources,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
