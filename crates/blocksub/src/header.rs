//! Chain head header as seen by the tracker.

use std::{fmt, sync::Arc};

use alloy_primitives::B256;

/// Alias for the 32-byte block hash.
pub type Hash256 = B256;

/// Full header as delivered by the node over JSON-RPC or WebSocket.
pub type RpcHeader = alloy_rpc_types_eth::Header;

/// An observed block header.
///
/// Cloning is cheap: the full RPC header, when present, is shared between
/// every subscriber that receives it.
#[derive(Clone, PartialEq, Eq)]
pub struct Header {
    number: u64,
    hash: Hash256,
    rpc: Option<Arc<RpcHeader>>,
}

impl Header {
    /// Creates a header from its identifying pair only.
    pub fn new(number: u64, hash: Hash256) -> Self {
        Self {
            number,
            hash,
            rpc: None,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    /// The full header received from the node, if this header came from one.
    pub fn rpc_header(&self) -> Option<&RpcHeader> {
        self.rpc.as_deref()
    }
}

impl From<RpcHeader> for Header {
    fn from(header: RpcHeader) -> Self {
        Self {
            number: header.number,
            hash: header.hash,
            rpc: Some(Arc::new(header)),
        }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("number", &self.number)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}
