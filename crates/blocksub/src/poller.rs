//! Periodic polling of the latest header.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    blocksub::Shared,
    header::Header,
    metrics::{self, ReconnectReason},
    source::HeaderFetcher,
};

pub(crate) struct Poller {
    shared: Arc<Shared>,
    fetcher: Arc<dyn HeaderFetcher>,
}

impl Poller {
    pub(crate) fn new(shared: Arc<Shared>, fetcher: Arc<dyn HeaderFetcher>) -> Self {
        Self { shared, fetcher }
    }

    /// Forward `initial`, then poll every `poll_interval` until shutdown.
    pub(crate) async fn run(self, initial: Header) {
        let shutdown_token = self.shared.shutdown_token.clone();
        let poll_interval = self.shared.config.poll_interval;

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately and `initial` stands in for it.
        interval.tick().await;

        info!(
            interval_ms = poll_interval.as_millis() as u64,
            "Poller started"
        );
        self.handle_header(initial).await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => {
                    info!("Poller received shutdown signal");
                    break;
                }

                _ = interval.tick() => self.poll_once().await,
            }
        }
    }

    async fn poll_once(&self) {
        let result = tokio::select! {
            _ = self.shared.shutdown_token.cancelled() => return,
            result = self.fetcher.fetch_latest_header() => result,
        };

        match result {
            Ok(header) => self.handle_header(header).await,
            Err(e) => {
                metrics::record_poll_failure();
                error!(error = %e, "Polling latest block failed");
            }
        }
    }

    async fn handle_header(&self, header: Header) {
        let number = header.number();
        if self.shared.config.debug {
            debug!(number, hash = %header.hash(), "Polled block");
        }

        if !self.shared.forward(header).await {
            return;
        }

        // Heal a subscription that silently fell behind.
        let Some(push_number) = self.shared.latest_push_number() else {
            return;
        };
        if push_number.saturating_add(self.shared.config.max_push_lag) < number {
            warn!(
                push_number,
                poll_number = number,
                "Forcing subscription reconnect from polling"
            );
            metrics::record_forced_reconnect(ReconnectReason::Lag);
            self.shared.spawn_reconnect();
        }
    }
}
