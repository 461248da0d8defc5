//! # Block subscriber
//!
//! [`BlockSub`] tracks the chain head from two independent sources and
//! republishes every new head to any number of [`Subscription`]s.
//!
//! ```text
//!   poll timer ──► Poller ─────┐
//!                              ├──► merge queue ──► Reconciler ──► SubscriberRegistry ──► Subscriptions
//!   newHeads ───► PushReceiver ┘                        │
//!                     ▲                                 └──► current head (watch)
//!                     │
//!               ReconnectGuard ◄── stream error / timeout / lag detected by Poller
//! ```
//!
//! Every background task descends from one root [`CancellationToken`];
//! [`BlockSub::stop`] cancels it and closes all subscriptions.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};
use url::Url;

use crate::{
    config::BlockSubConfig,
    error::{Error, Result},
    header::Header,
    metrics,
    poller::Poller,
    push::PushReceiver,
    reconciler::Reconciler,
    reconnect::{ReconnectGuard, ReconnectOutcome},
    registry::{SubscriberRegistry, Subscription},
    rpc::RpcHeaderFetcher,
    source::{HeaderFetcher, HeaderSubscriber},
    ws::WsHeaderSubscriber,
};

/// State shared by the orchestrator and its background tasks.
pub(crate) struct Shared {
    pub(crate) config: BlockSubConfig,
    pub(crate) shutdown_token: CancellationToken,
    fetcher: Option<Arc<dyn HeaderFetcher>>,
    subscriber: Option<Arc<dyn HeaderSubscriber>>,
    merge_tx: mpsc::Sender<Header>,
    registry: Arc<SubscriberRegistry>,
    reconnect_guard: ReconnectGuard,
    /// Token of the live subscription connection.
    connection: Mutex<Option<CancellationToken>>,
    latest_push_number: Mutex<Option<u64>>,
    tracker: TaskTracker,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    /// Hand a header to the reconciler. Returns `false` once shutting down.
    pub(crate) async fn forward(&self, header: Header) -> bool {
        tokio::select! {
            _ = self.shutdown_token.cancelled() => false,
            result = self.merge_tx.send(header) => result.is_ok(),
        }
    }

    pub(crate) fn latest_push_number(&self) -> Option<u64> {
        *lock(&self.latest_push_number)
    }

    pub(crate) fn set_latest_push_number(&self, number: u64) {
        *lock(&self.latest_push_number) = Some(number);
    }

    fn close_connection(&self) {
        if let Some(previous) = lock(&self.connection).take() {
            previous.cancel();
        }
    }

    /// Re-establish the subscription through the reconnect guard.
    pub(crate) async fn reconnect(self: &Arc<Self>, retry_forever: bool) -> Result<ReconnectOutcome> {
        self.reconnect_guard
            .attempt(retry_forever, &self.shutdown_token, || self.connect())
            .await
    }

    /// Reconnect in the background, retrying until it succeeds or shutdown.
    pub(crate) fn spawn_reconnect(self: &Arc<Self>) {
        let shared = self.clone();
        self.tracker.spawn(async move {
            if let Err(e) = shared.reconnect(true).await {
                info!(error = %e, "Subscription reconnect abandoned");
            }
        });
    }

    /// Close the previous connection, open a new one and spawn its receiver.
    async fn connect(self: &Arc<Self>) -> Result<()> {
        let Some(subscriber) = &self.subscriber else {
            return Ok(());
        };

        self.close_connection();

        info!("Connecting to subscription source");
        let result = subscriber.subscribe_heads().await;
        metrics::record_reconnect_attempt(result.is_ok());
        let stream = result?;

        let token = self.shutdown_token.child_token();
        *lock(&self.connection) = Some(token.clone());
        self.tracker
            .spawn(PushReceiver::new(self.clone(), stream, token).run());

        info!("Subscribed to newHeads");
        Ok(())
    }
}

enum State {
    Idle(Reconciler),
    Running,
    Stopped,
}

/// Chain head tracker combining polling and a push subscription.
///
/// Lifecycle: constructed idle, [`start`](Self::start) once, [`stop`](Self::stop)
/// any number of times. A stopped instance cannot be restarted. Dropping it
/// stops it.
pub struct BlockSub {
    shared: Arc<Shared>,
    state: Mutex<State>,
    head_rx: watch::Receiver<Option<Header>>,
}

impl BlockSub {
    /// Create an idle block subscriber over the given sources.
    ///
    /// At least one source must be given for [`start`](Self::start) to succeed.
    pub fn new(
        config: BlockSubConfig,
        fetcher: Option<Arc<dyn HeaderFetcher>>,
        subscriber: Option<Arc<dyn HeaderSubscriber>>,
    ) -> Self {
        let registry = Arc::new(SubscriberRegistry::new(config.subscriber_capacity));
        let (merge_tx, merge_rx) = mpsc::channel(1);
        let (head_tx, head_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            reconnect_guard: ReconnectGuard::new(
                config.reconnect_initial_delay,
                config.reconnect_max_delay,
            ),
            config,
            shutdown_token: CancellationToken::new(),
            fetcher,
            subscriber,
            merge_tx,
            registry: registry.clone(),
            connection: Mutex::new(None),
            latest_push_number: Mutex::new(None),
            tracker: TaskTracker::new(),
        });

        Self {
            shared,
            state: Mutex::new(State::Idle(Reconciler::new(merge_rx, registry, head_tx))),
            head_rx,
        }
    }

    /// Create a block subscriber polling `http_url` and subscribing to `ws_url`.
    pub fn with_endpoints(
        config: BlockSubConfig,
        http_url: Option<Url>,
        ws_url: Option<Url>,
    ) -> Self {
        let fetcher = http_url
            .map(|url| Arc::new(RpcHeaderFetcher::new(url)) as Arc<dyn HeaderFetcher>);
        let subscriber = ws_url
            .map(|url| Arc::new(WsHeaderSubscriber::new(url)) as Arc<dyn HeaderSubscriber>);
        Self::new(config, fetcher, subscriber)
    }

    /// Start the reconciler and connect both sources.
    ///
    /// The subscription is established and the first poll is performed before
    /// returning, so a misconfigured endpoint fails here. On failure the block
    /// subscriber is stopped before the error is returned.
    pub async fn start(&self) -> Result<()> {
        if self.shared.fetcher.is_none() && self.shared.subscriber.is_none() {
            return Err(Error::NoSources);
        }

        let reconciler = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, State::Running) {
                State::Idle(reconciler) => reconciler,
                State::Running => return Err(Error::AlreadyStarted),
                State::Stopped => {
                    *state = State::Stopped;
                    return Err(Error::Stopped);
                }
            }
        };

        self.shared
            .tracker
            .spawn(reconciler.run(self.shared.shutdown_token.clone()));

        if let Err(e) = self.start_sources().await {
            error!(error = %e, "Block subscriber failed to start");
            self.stop();
            return Err(e);
        }

        info!("Block subscriber started");
        Ok(())
    }

    async fn start_sources(&self) -> Result<()> {
        if self.shared.subscriber.is_some() {
            self.shared.reconnect(false).await?;
        }

        if let Some(fetcher) = &self.shared.fetcher {
            let header = tokio::select! {
                _ = self.shared.shutdown_token.cancelled() => return Err(Error::Cancelled),
                header = fetcher.fetch_latest_header() => header?,
            };
            info!(number = header.number(), hash = %header.hash(), "Polling connected");

            let poller = Poller::new(self.shared.clone(), fetcher.clone());
            self.shared.tracker.spawn(poller.run(header));
        }

        Ok(())
    }

    /// Subscribe to new chain heads until `token` is cancelled.
    ///
    /// A subscription made after [`stop`](Self::stop) is returned already closed.
    /// Must be called within a Tokio runtime.
    pub fn subscribe(&self, token: &CancellationToken) -> Subscription {
        let subscription = self.shared.registry.register(token);
        if subscription.is_stopped() {
            return subscription;
        }

        let handle = subscription.handle();
        let shutdown_token = self.shared.shutdown_token.clone();
        self.shared.tracker.spawn(async move {
            tokio::select! {
                _ = handle.token().cancelled() => {}
                _ = shutdown_token.cancelled() => {}
            }
            handle.unsubscribe();
        });

        subscription
    }

    /// Stop all background tasks and close every subscription.
    ///
    /// Idempotent and non-blocking; use [`shutdown`](Self::shutdown) to also wait
    /// for the tasks to finish.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), State::Stopped);
        if matches!(previous, State::Stopped) {
            return;
        }

        info!("Stopping block subscriber");
        self.shared.shutdown_token.cancel();
        self.shared.close_connection();
        self.shared.registry.close();
        self.shared.tracker.close();
    }

    /// Stop and wait until every background task has exited.
    pub async fn shutdown(&self) {
        self.stop();
        self.shared.tracker.wait().await;
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.state), State::Running)
    }

    /// The most recently accepted header.
    pub fn current_head(&self) -> Option<Header> {
        self.head_rx.borrow().clone()
    }

    /// A receiver that observes every change of the current head.
    pub fn watch_head(&self) -> watch::Receiver<Option<Header>> {
        self.head_rx.clone()
    }
}

impl Drop for BlockSub {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BlockSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSub")
            .field("running", &self.is_running())
            .field("polling", &self.shared.fetcher.is_some())
            .field("subscribing", &self.shared.subscriber.is_some())
            .field("current_head", &self.current_head())
            .finish()
    }
}
