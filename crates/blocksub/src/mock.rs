//! Scripted header sources for tests.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::{
    error::{Error, Result},
    header::Header,
    source::{HeadStream, HeaderFetcher, HeaderSubscriber},
};

/// Fetcher returning a settable head. Without a head, every fetch fails.
pub(crate) struct MockFetcher {
    head: Mutex<Option<Header>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub(crate) fn new(head: Option<Header>) -> Self {
        Self {
            head: Mutex::new(head),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_head(&self, header: Header) {
        *self.head.lock().unwrap() = Some(header);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeaderFetcher for MockFetcher {
    async fn fetch_latest_header(&self) -> Result<Header> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Rpc {
                code: -32000,
                message: "unavailable".to_string(),
            });
        }
        self.head.lock().unwrap().clone().ok_or(Error::MissingHeader)
    }
}

type Connection = Option<mpsc::UnboundedSender<Result<Header>>>;

/// Subscriber whose connections are driven from the test.
///
/// Every successful `subscribe_heads` opens a new connection; `push`,
/// `fail_stream` and `close_stream` act on the most recent one.
pub(crate) struct MockSubscriber {
    connections: Mutex<Vec<Connection>>,
    connects: AtomicUsize,
    fail_next: AtomicUsize,
}

impl MockSubscriber {
    pub(crate) fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Number of `subscribe_heads` calls, failed ones included.
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make the next `n` connection attempts fail.
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn send(&self, item: Result<Header>) {
        let connections = self.connections.lock().unwrap();
        if let Some(Some(tx)) = connections.last() {
            let _ = tx.send(item);
        }
    }

    pub(crate) fn push(&self, header: Header) {
        self.send(Ok(header));
    }

    pub(crate) fn fail_stream(&self) {
        self.send(Err(Error::WebSocket("connection reset".to_string())));
    }

    /// End the latest stream cleanly.
    pub(crate) fn close_stream(&self) {
        if let Some(connection) = self.connections.lock().unwrap().last_mut() {
            connection.take();
        }
    }

    fn is_closed(&self, back: usize) -> bool {
        let connections = self.connections.lock().unwrap();
        let index = connections.len().checked_sub(back + 1).unwrap();
        connections[index].as_ref().is_none_or(|tx| tx.is_closed())
    }

    /// Whether the receiving side of the latest connection was dropped.
    pub(crate) fn latest_is_closed(&self) -> bool {
        self.is_closed(0)
    }

    /// Whether the receiving side of the connection before the latest was dropped.
    pub(crate) fn previous_is_closed(&self) -> bool {
        self.is_closed(1)
    }
}

#[async_trait]
impl HeaderSubscriber for MockSubscriber {
    async fn subscribe_heads(&self) -> Result<HeadStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::WebSocket("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().unwrap().push(Some(tx));
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

/// Wait until `condition` holds, panicking after two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
