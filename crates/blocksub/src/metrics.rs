//! Metrics emitted by the block subscriber.
//!
//! All helpers go through the `metrics` facade and are no-ops until a recorder
//! is installed, see [`init_metrics`].

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Why a subscription reconnect was forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectReason {
    /// The subscription trailed the poller by more than the allowed lag.
    Lag,
    /// No header arrived within the subscription timeout.
    Timeout,
    /// The subscription reported an error.
    Error,
}

impl ReconnectReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Lag => "lag",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// Install the Prometheus exporter listening on `addr` and register metric
/// descriptions.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_gauge!(
        "blocksub_latest_block_number",
        "Number of the most recently accepted chain head"
    );
    describe_counter!(
        "blocksub_poll_failures_total",
        "Failed polls of the latest header"
    );
    describe_counter!(
        "blocksub_reconnect_attempts_total",
        "Physical subscription connection attempts"
    );
    describe_counter!(
        "blocksub_reconnects_total",
        "Successful subscription connections"
    );
    describe_counter!(
        "blocksub_forced_reconnects_total",
        "Reconnects triggered by lag, timeout or subscription error"
    );
    describe_counter!(
        "blocksub_dropped_deliveries_total",
        "Headers dropped for subscribers that were not ready to receive"
    );
}

pub(crate) fn set_block_number(number: u64) {
    gauge!("blocksub_latest_block_number").set(number as f64);
}

pub(crate) fn record_poll_failure() {
    counter!("blocksub_poll_failures_total").increment(1);
}

pub(crate) fn record_reconnect_attempt(success: bool) {
    counter!("blocksub_reconnect_attempts_total").increment(1);
    if success {
        counter!("blocksub_reconnects_total").increment(1);
    }
}

pub(crate) fn record_forced_reconnect(reason: ReconnectReason) {
    counter!("blocksub_forced_reconnects_total", "reason" => reason.as_str()).increment(1);
}

pub(crate) fn record_dropped_delivery() {
    counter!("blocksub_dropped_deliveries_total").increment(1);
}
