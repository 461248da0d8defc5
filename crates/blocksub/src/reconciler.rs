//! # Reconciler
//!
//! The reconciler owns the authoritative chain head. Both sources push raw
//! headers into one merge queue; [`Reconciler::run`] drains it serially, so the
//! head state is written by a single task and needs no lock.
//!
//! A header is accepted iff its number is at least the current number and its
//! hash differs from the current hash. Same-height headers with a new hash
//! (reorgs at the tip) are therefore forwarded, while stale headers from a
//! lagging source are dropped silently.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    header::{Hash256, Header},
    metrics,
    registry::SubscriberRegistry,
};

/// The most recently accepted header.
#[derive(Debug, Default)]
pub struct HeadState {
    current: Option<Header>,
}

impl HeadState {
    pub fn current(&self) -> Option<&Header> {
        self.current.as_ref()
    }

    pub fn current_number(&self) -> u64 {
        self.current.as_ref().map_or(0, Header::number)
    }

    pub fn current_hash(&self) -> Option<Hash256> {
        self.current.as_ref().map(Header::hash)
    }

    /// Apply the acceptance rule, updating the state if `header` supersedes it.
    ///
    /// Returns `true` if the header was accepted.
    pub fn reconcile(&mut self, header: &Header) -> bool {
        let accepted = header.number() >= self.current_number()
            && Some(header.hash()) != self.current_hash();
        if accepted {
            self.current = Some(header.clone());
        }
        accepted
    }
}

/// Serial consumer of the merge queue.
pub(crate) struct Reconciler {
    state: HeadState,
    merge_rx: mpsc::Receiver<Header>,
    registry: Arc<SubscriberRegistry>,
    head_tx: watch::Sender<Option<Header>>,
}

impl Reconciler {
    pub(crate) fn new(
        merge_rx: mpsc::Receiver<Header>,
        registry: Arc<SubscriberRegistry>,
        head_tx: watch::Sender<Option<Header>>,
    ) -> Self {
        Self {
            state: HeadState::default(),
            merge_rx,
            registry,
            head_tx,
        }
    }

    fn handle_header(&mut self, header: Header) {
        if !self.state.reconcile(&header) {
            return;
        }

        debug!(number = header.number(), hash = %header.hash(), "New chain head");
        metrics::set_block_number(header.number());
        self.head_tx.send_replace(Some(header.clone()));
        self.registry.broadcast(&header);
    }

    pub(crate) async fn run(mut self, shutdown_token: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                header = self.merge_rx.recv() => {
                    match header {
                        Some(header) => self.handle_header(header),
                        None => break,
                    }
                }
            }
        }
    }
}
