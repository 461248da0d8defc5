//! Receive task of a live `newHeads` subscription.

use std::sync::Arc;

use futures::{StreamExt, future::BoxFuture};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    blocksub::Shared,
    metrics::{self, ReconnectReason},
    source::HeadStream,
};

/// Forwards headers of one connection into the merge queue until the
/// connection is cancelled, fails, goes stale, or closes cleanly.
pub(crate) struct PushReceiver {
    shared: Arc<Shared>,
    stream: HeadStream,
    token: CancellationToken,
}

impl PushReceiver {
    pub(crate) fn new(shared: Arc<Shared>, stream: HeadStream, token: CancellationToken) -> Self {
        Self {
            shared,
            stream,
            token,
        }
    }

    /// Boxed because the receiver spawns its successor through the reconnect.
    pub(crate) fn run(self) -> BoxFuture<'static, ()> {
        Box::pin(self.receive())
    }

    async fn receive(mut self) {
        let timeout = self.shared.config.subscription_timeout;
        let stale = sleep(timeout);
        tokio::pin!(stale);

        let reason = loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    debug!("Subscription receiver stopped");
                    return;
                }

                item = self.stream.next() => match item {
                    Some(Ok(header)) => {
                        stale.as_mut().reset(Instant::now() + timeout);
                        if self.shared.config.debug {
                            debug!(number = header.number(), hash = %header.hash(), "Subscription block");
                        }
                        self.shared.set_latest_push_number(header.number());
                        if !self.shared.forward(header).await {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Subscription failed, reconnecting now");
                        break ReconnectReason::Error;
                    }
                    None => {
                        info!("Subscription closed");
                        return;
                    }
                },

                _ = &mut stale => {
                    error!(timeout_ms = timeout.as_millis() as u64, "Subscription timed out, reconnecting now");
                    break ReconnectReason::Timeout;
                }
            }
        };

        metrics::record_forced_reconnect(reason);
        // Release this connection before the next one is opened.
        drop(self.stream);

        if let Err(e) = self.shared.reconnect(true).await {
            debug!(error = %e, "Subscription reconnect abandoned");
        }
    }
}
