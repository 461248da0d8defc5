//! Block subscriber - tracks the head of an Ethereum-style chain.
//!
//! Headers arrive from two sources: periodic polling of `eth_getBlockByNumber`
//! over HTTP and a `newHeads` subscription over WebSocket. They are reconciled
//! into a single monotonic head and fanned out to any number of subscribers.
//! The poller also watches the subscription: if it falls behind, or goes quiet,
//! the subscription is re-established.
//!
//! ## Example
//!
//! ```ignore
//! use blocksub::{BlockSub, BlockSubConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let blocksub = BlockSub::with_endpoints(
//!     BlockSubConfig::default(),
//!     Some("http://localhost:8545".parse()?),
//!     Some("ws://localhost:8546".parse()?),
//! );
//! blocksub.start().await?;
//!
//! let mut sub = blocksub.subscribe(&CancellationToken::new());
//! while let Some(header) = sub.recv().await {
//!     println!("{} {}", header.number(), header.hash());
//! }
//! ```

pub mod blocksub;
pub mod config;
pub mod error;
pub mod header;
pub mod metrics;
mod poller;
mod push;
pub mod reconciler;
pub mod reconnect;
pub mod registry;
pub mod rpc;
pub mod source;
pub mod ws;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main types at crate root for convenience.
pub use blocksub::BlockSub;
pub use config::{BlockSubConfig, Config};
pub use error::{Error, Result};
pub use header::{Hash256, Header, RpcHeader};
pub use metrics::{describe_metrics, init_metrics};
pub use reconciler::HeadState;
pub use reconnect::{ReconnectGuard, ReconnectOutcome};
pub use registry::{SubscriberRegistry, Subscription, SubscriptionHandle, SubscriptionId};
pub use rpc::RpcHeaderFetcher;
pub use source::{HeadStream, HeaderFetcher, HeaderSubscriber};
pub use ws::WsHeaderSubscriber;
