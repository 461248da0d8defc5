//! WebSocket subscription source for new block headers.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use alloy_provider::{Provider, ProviderBuilder, WsConnect};
use async_trait::async_trait;
use futures::Stream;
use url::Url;

use crate::{
    error::{Error, Result},
    header::{Header, RpcHeader},
    source::{HeadStream, HeaderSubscriber},
};

/// Stream of new block headers that keeps the provider alive.
///
/// The server closing the subscription is never a clean shutdown from our point
/// of view, so the end of the underlying stream is reported as a single error
/// before the stream finishes.
struct BlockSubscription<P> {
    #[allow(dead_code)]
    provider: P,
    stream: Pin<Box<dyn Stream<Item = RpcHeader> + Send>>,
    ended: bool,
}

impl<P> Unpin for BlockSubscription<P> {}

impl<P: Send> Stream for BlockSubscription<P> {
    type Item = Result<Header>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.ended {
            return Poll::Ready(None);
        }

        match self.stream.as_mut().poll_next(cx) {
            Poll::Ready(Some(header)) => Poll::Ready(Some(Ok(Header::from(header)))),
            Poll::Ready(None) => {
                self.ended = true;
                Poll::Ready(Some(Err(Error::WebSocket(
                    "subscription closed by server".to_string(),
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Subscribes to `newHeads` on a node's WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsHeaderSubscriber {
    ws_url: Url,
}

impl WsHeaderSubscriber {
    pub fn new(ws_url: Url) -> Self {
        Self { ws_url }
    }

    /// Return url of the WebSocket endpoint.
    pub fn url(&self) -> &Url {
        &self.ws_url
    }
}

#[async_trait]
impl HeaderSubscriber for WsHeaderSubscriber {
    async fn subscribe_heads(&self) -> Result<HeadStream> {
        let ws = WsConnect::new(self.ws_url.as_str());
        let provider = ProviderBuilder::new()
            .connect_ws(ws)
            .await
            .map_err(|e| Error::WebSocket(format!("WebSocket connection failed: {e}")))?;

        let subscription = provider
            .subscribe_blocks()
            .await
            .map_err(|e| Error::WebSocket(format!("Block subscription failed: {e}")))?;

        let stream = Box::pin(subscription.into_stream());

        Ok(Box::pin(BlockSubscription {
            provider,
            stream,
            ended: false,
        }))
    }
}
