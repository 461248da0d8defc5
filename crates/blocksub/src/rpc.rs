//! JSON-RPC polling source for execution layer nodes.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

use crate::{
    error::{Error, Result},
    header::{Header, RpcHeader},
    source::HeaderFetcher,
};

/// JSON-RPC request structure.
#[derive(Debug, Clone, Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error structure.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Fetches the latest header from a node over HTTP JSON-RPC.
#[derive(Debug)]
pub struct RpcHeaderFetcher {
    url: Url,
    http_client: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcHeaderFetcher {
    /// Default timeout for a single request.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a new fetcher for the given endpoint.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            http_client: reqwest::Client::new(),
            timeout: Self::DEFAULT_TIMEOUT,
            next_id: AtomicU64::new(1),
        }
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Return url of the node.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send a JSON-RPC request to the node.
    ///
    /// Returns `None` if the RPC response has a null `result`.
    async fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: P,
    ) -> Result<Option<R>> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let response = self
            .http_client
            .post(self.url.clone())
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Rpc {
                code: response.status().as_u16() as i64,
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body = response.bytes().await?;
        let rpc_response: JsonRpcResponse<R> = serde_json::from_slice(&body)?;

        if let Some(error) = rpc_response.error {
            return Err(Error::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        Ok(rpc_response.result)
    }

    /// Fetch the header of the latest block.
    pub async fn get_latest_header(&self) -> Result<RpcHeader> {
        self.request("eth_getBlockByNumber", ("latest", false))
            .await?
            .ok_or(Error::MissingHeader)
    }
}

#[async_trait]
impl HeaderFetcher for RpcHeaderFetcher {
    async fn fetch_latest_header(&self) -> Result<Header> {
        self.get_latest_header().await.map(Header::from)
    }
}
