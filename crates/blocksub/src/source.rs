//! Header sources the block subscriber is built on.
//!
//! Two capabilities feed the tracker: a pull-style fetch of the latest header,
//! invoked on a timer, and a push-style subscription that yields headers as the
//! node announces them. [`RpcHeaderFetcher`](crate::RpcHeaderFetcher) and
//! [`WsHeaderSubscriber`](crate::WsHeaderSubscriber) are the network-backed
//! implementations.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{error::Result, header::Header};

/// Stream of headers from a push subscription.
///
/// - `Some(Ok(header))` delivers a new header.
/// - `Some(Err(e))` reports abnormal termination; the receiver reconnects.
/// - `None` is a clean shutdown; the receiver exits without reconnecting.
pub type HeadStream = BoxStream<'static, Result<Header>>;

/// Pull-style header source.
#[async_trait]
pub trait HeaderFetcher: Send + Sync + 'static {
    /// Fetch the latest header.
    ///
    /// Must be safe to call repeatedly; a failure is reported afresh on every call
    /// rather than cached.
    async fn fetch_latest_header(&self) -> Result<Header>;
}

/// Push-style header source.
#[async_trait]
pub trait HeaderSubscriber: Send + Sync + 'static {
    /// Open a new subscription to chain heads.
    ///
    /// The connection lives as long as the returned stream; dropping the stream
    /// closes it.
    async fn subscribe_heads(&self) -> Result<HeadStream>;
}
