//! # Reconnect guard
//!
//! Several tasks may decide at the same time that the subscription needs to be
//! re-established: the poller when the subscription lags, the receive task on a
//! stream error or timeout. [`ReconnectGuard`] turns those triggers into a single
//! physical reconnect. The first caller becomes the leader and runs the connect
//! routine; callers arriving while it runs wait for it to finish and return
//! without connecting themselves.

use std::{
    future::Future,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::{Error, Result};

/// How a call to [`ReconnectGuard::attempt`] was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// This caller led the attempt and the connection is up.
    Connected,
    /// Another caller was already reconnecting; this one waited for it.
    Joined,
}

/// Leader/follower serializer for subscription (re)connects.
#[derive(Debug)]
pub struct ReconnectGuard {
    connecting: Mutex<bool>,
    finished: Notify,
    initial_delay: Duration,
    max_delay: Duration,
}

impl ReconnectGuard {
    /// Create a guard that backs off from `initial_delay` up to `max_delay`
    /// between failed attempts.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            connecting: Mutex::new(false),
            finished: Notify::new(),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.connecting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a reconnect is in progress.
    pub fn is_connecting(&self) -> bool {
        *self.lock()
    }

    /// Run `connect` unless another caller is already doing so.
    ///
    /// As leader, `connect` is invoked once; with `retry_forever` it is invoked
    /// again after each failure with an exponentially growing delay until it
    /// succeeds or `shutdown` is cancelled. Without `retry_forever` the first
    /// error is returned.
    ///
    /// As follower, the call waits until the leader is done and returns
    /// [`ReconnectOutcome::Joined`].
    pub async fn attempt<F, Fut>(
        &self,
        retry_forever: bool,
        shutdown: &CancellationToken,
        mut connect: F,
    ) -> Result<ReconnectOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        // A follower registers for the wake-up while holding the lock, so it
        // waits for the attempt it observed and no earlier one.
        let following = {
            let mut connecting = self.lock();
            if *connecting {
                Some(self.finished.notified())
            } else {
                *connecting = true;
                None
            }
        };

        if let Some(finished) = following {
            tokio::select! {
                _ = shutdown.cancelled() => return Err(Error::Cancelled),
                _ = finished => return Ok(ReconnectOutcome::Joined),
            }
        }

        let _leader = Leader(self);
        let mut delay = self.initial_delay;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                _ = shutdown.cancelled() => return Err(Error::Cancelled),
                result = connect() => result,
            };

            match result {
                Ok(()) => return Ok(ReconnectOutcome::Connected),
                Err(e) if !retry_forever => return Err(e),
                Err(e) => {
                    error!(
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Subscription connection failed"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = delay.saturating_mul(2).min(self.max_delay);
        }
    }
}

/// Clears the connecting flag and wakes followers when the leader is done,
/// including when its future is dropped mid-attempt.
struct Leader<'a>(&'a ReconnectGuard);

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        *self.0.lock() = false;
        self.0.finished.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;

    fn guard() -> Arc<ReconnectGuard> {
        Arc::new(ReconnectGuard::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
        ))
    }

    #[tokio::test]
    async fn concurrent_triggers_collapse_into_one_attempt() {
        let guard = guard();
        let shutdown = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let connected = Arc::new(AtomicBool::new(false));

        let leader = tokio::spawn({
            let (guard, shutdown) = (guard.clone(), shutdown.clone());
            let (attempts, connected) = (attempts.clone(), connected.clone());
            async move {
                guard
                    .attempt(true, &shutdown, || {
                        let (attempts, connected) = (attempts.clone(), connected.clone());
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            connected.store(true, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .await
            }
        });

        while !guard.is_connecting() {
            tokio::task::yield_now().await;
        }

        // One simulated staleness trigger and one simulated stream error.
        let followers: Vec<_> = (0..2)
            .map(|_| {
                let (guard, shutdown) = (guard.clone(), shutdown.clone());
                let (attempts, connected) = (attempts.clone(), connected.clone());
                tokio::spawn(async move {
                    let outcome = guard
                        .attempt(true, &shutdown, || {
                            let attempts = attempts.clone();
                            async move {
                                attempts.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                        })
                        .await;
                    (outcome, connected.load(Ordering::SeqCst))
                })
            })
            .collect();

        assert_eq!(leader.await.unwrap().unwrap(), ReconnectOutcome::Connected);
        for follower in followers {
            let (outcome, connected_when_returned) = follower.await.unwrap();
            assert_eq!(outcome.unwrap(), ReconnectOutcome::Joined);
            assert!(connected_when_returned);
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!guard.is_connecting());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn follower_of_a_later_leader_waits_for_its_attempt() {
        let guard = guard();
        let shutdown = CancellationToken::new();

        // A completed attempt leaves nothing a later follower could wake on.
        let outcome = guard
            .attempt(false, &shutdown, || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(outcome, ReconnectOutcome::Connected);

        let release = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let leader = tokio::spawn({
            let (guard, shutdown) = (guard.clone(), shutdown.clone());
            let (release, finished) = (release.clone(), finished.clone());
            async move {
                guard
                    .attempt(false, &shutdown, || {
                        let (release, finished) = (release.clone(), finished.clone());
                        async move {
                            release.notified().await;
                            finished.store(true, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .await
            }
        });

        while !guard.is_connecting() {
            tokio::task::yield_now().await;
        }

        let follower = tokio::spawn({
            let (guard, shutdown, finished) = (guard.clone(), shutdown.clone(), finished.clone());
            async move {
                let outcome = guard.attempt(false, &shutdown, || async { Ok(()) }).await;
                (outcome, finished.load(Ordering::SeqCst))
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!follower.is_finished());

        release.notify_one();
        assert_eq!(leader.await.unwrap().unwrap(), ReconnectOutcome::Connected);
        let (outcome, finished_when_returned) = follower.await.unwrap();
        assert_eq!(outcome.unwrap(), ReconnectOutcome::Joined);
        assert!(finished_when_returned);
    }

    #[tokio::test]
    async fn single_attempt_returns_first_error() {
        let guard = guard();
        let attempts = AtomicUsize::new(0);

        let result = guard
            .attempt(false, &CancellationToken::new(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::WebSocket("refused".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::WebSocket(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!guard.is_connecting());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_forever_backs_off_until_success() {
        let guard = guard();
        let attempts = AtomicUsize::new(0);
        let start = tokio::time::Instant::now();

        let outcome = guard
            .attempt(true, &CancellationToken::new(), || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 4 {
                        Err(Error::WebSocket("refused".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, ReconnectOutcome::Connected);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        // 10 + 20 + 40 + 40 (capped)
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(110), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(150), "{elapsed:?}");
    }

    #[tokio::test]
    async fn shutdown_stops_retrying_and_releases_guard() {
        let guard = guard();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let (guard, shutdown) = (guard.clone(), shutdown.clone());
            async move {
                guard
                    .attempt(true, &shutdown, || async {
                        Err(Error::WebSocket("refused".to_string()))
                    })
                    .await
            }
        });

        while !guard.is_connecting() {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();

        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
        assert!(!guard.is_connecting());
    }

    #[tokio::test]
    async fn sequential_attempts_each_connect() {
        let guard = guard();
        let shutdown = CancellationToken::new();
        let attempts = AtomicUsize::new(0);

        for _ in 0..3 {
            let outcome = guard
                .attempt(false, &shutdown, || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .await
                .unwrap();
            assert_eq!(outcome, ReconnectOutcome::Connected);
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
