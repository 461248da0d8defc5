//! Configuration types for the block subscriber.

use std::{net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use url::Url;

use crate::error::{Error, Result};

/// Tuning knobs of a [`BlockSub`](crate::BlockSub).
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BlockSubConfig {
    /// Interval between two polls of the latest header.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Reconnect the subscription when no header arrived for this long.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "subscription_timeout_ms")]
    pub subscription_timeout: Duration,
    /// Number of blocks the subscription may trail the poller before it is
    /// forcibly reconnected.
    pub max_push_lag: u64,
    /// Delay after the first failed reconnect attempt.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "reconnect_initial_delay_ms")]
    pub reconnect_initial_delay: Duration,
    /// Upper bound for the delay between reconnect attempts.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "reconnect_max_delay_ms")]
    pub reconnect_max_delay: Duration,
    /// Headers buffered per subscriber before further headers are dropped for it.
    pub subscriber_capacity: usize,
    /// Emit a debug event for every polled and received header.
    pub debug: bool,
}

impl Default for BlockSubConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            subscription_timeout: Duration::from_secs(60),
            max_push_lag: 2,
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            subscriber_capacity: 1,
            debug: false,
        }
    }
}

/// Configuration of the `blocksub` binary.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// HTTP JSON-RPC URL polled for the latest header (usually port 8545).
    pub http_url: Option<Url>,
    /// WebSocket URL for the `newHeads` subscription (usually port 8546).
    pub ws_url: Option<Url>,
    /// Timeout of a single poll request.
    pub request_timeout_ms: Option<u64>,
    /// Address to serve Prometheus metrics on.
    pub metrics_addr: Option<SocketAddr>,
    #[serde(flatten)]
    pub blocksub: BlockSubConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(toml_edit::de::from_str(&content)?)
    }

    /// Timeout of a single poll request, if configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}
