//! Subscriber registry and consumer-facing subscriptions.
//!
//! Accepted headers are fanned out with a non-blocking send per subscriber. A
//! subscriber whose queue is full misses that header; nobody else is held up,
//! and neither is the reconciler.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::trace;

use crate::{header::Header, metrics};

/// Identifier of a subscription, unique within one registry.
pub type SubscriptionId = u64;

struct Entry {
    tx: mpsc::Sender<Header>,
    handle: SubscriptionHandle,
}

#[derive(Default)]
struct Subscribers {
    next_id: SubscriptionId,
    entries: HashMap<SubscriptionId, Entry>,
    closed: bool,
}

/// Set of live subscriptions.
pub struct SubscriberRegistry {
    subscribers: Mutex<Subscribers>,
    capacity: usize,
}

impl SubscriberRegistry {
    /// Create a registry whose subscriptions buffer up to `capacity` headers.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Subscribers::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        // Critical sections never panic, recover the data if one ever did.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscription scoped to a child of `parent`.
    ///
    /// After [`close`](Self::close) the returned subscription is already closed.
    pub fn register(self: &Arc<Self>, parent: &CancellationToken) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let token = parent.child_token();

        let mut subscribers = self.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;

        let handle = SubscriptionHandle {
            inner: Arc::new(HandleInner {
                id,
                stopped: AtomicBool::new(false),
                token,
                registry: Arc::downgrade(self),
            }),
        };

        if subscribers.closed {
            drop(subscribers);
            drop(tx);
            handle.unsubscribe();
        } else {
            subscribers.entries.insert(
                id,
                Entry {
                    tx,
                    handle: handle.clone(),
                },
            );
        }

        Subscription { rx, handle }
    }

    /// Deliver `header` to every subscriber that is ready for it.
    pub fn broadcast(&self, header: &Header) {
        let mut subscribers = self.lock();
        subscribers
            .entries
            .retain(|id, entry| match entry.tx.try_send(header.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    trace!(subscription = id, number = header.number(), "Subscriber not ready, header dropped");
                    metrics::record_dropped_delivery();
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }

    /// Close every subscription and refuse new ones.
    pub fn close(&self) {
        let entries: Vec<Entry> = {
            let mut subscribers = self.lock();
            subscribers.closed = true;
            subscribers.entries.drain().map(|(_, entry)| entry).collect()
        };

        for Entry { tx, handle } in entries {
            drop(tx);
            handle.unsubscribe();
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn remove(&self, id: SubscriptionId) {
        let entry = self.lock().entries.remove(&id);
        // Dropped outside the lock; this closes the subscriber's queue.
        drop(entry);
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

struct HandleInner {
    id: SubscriptionId,
    stopped: AtomicBool,
    token: CancellationToken,
    registry: Weak<SubscriberRegistry>,
}

/// Cloneable control side of a [`Subscription`].
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    /// Stop the subscription and close its queue.
    ///
    /// Safe to call any number of times from any task. Returns `true` for the one
    /// call that actually stopped it.
    pub fn unsubscribe(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.inner.token.cancel();
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(self.inner.id);
        }
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Completes once the subscription is cancelled.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.token.clone().cancelled_owned()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.inner.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A consumer of new chain heads.
///
/// Headers arrive until the subscription is cancelled, unsubscribed, dropped, or
/// the block subscriber stops; after that the queue yields `None`. Delivery is
/// best effort: a header that arrives while the queue is full is skipped.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Header>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.handle.id()
    }

    /// Receive the next header, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Header> {
        if self.is_stopped() {
            return None;
        }
        let header = self.rx.recv().await?;
        (!self.is_stopped()).then_some(header)
    }

    /// Completes once the subscription is cancelled.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.handle.done()
    }

    /// See [`SubscriptionHandle::unsubscribe`].
    pub fn unsubscribe(&self) -> bool {
        self.handle.unsubscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_stopped()
    }

    /// A handle that can stop this subscription from another task.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }
}

impl Stream for Subscription {
    type Item = Header;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Headers still queued when the subscription stopped are discarded.
        if self.is_stopped() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}
