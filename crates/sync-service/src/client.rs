use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chain_store::ChainStore;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{ChainDescriptor, ClientKind, SkipReason};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc POST failed: {0}")]
    Post(#[from] reqwest::Error),
    #[error("rpc HTTP {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("rpc JSON decode failed: {0}")]
    JsonDecode(#[source] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("rpc response carried no result")]
    MissingResult,
    #[error("malformed quantity {0:?}")]
    MalformedQuantity(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("no block at height {height}")]
    MissingBlock { height: u64 },
    #[error("store error: {0}")]
    Store(#[from] chain_store::StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-chain collaborator contract. Implementations own the wire protocol
/// and the durable storage of raw block payloads.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Highest block height the remote currently reports.
    async fn latest_block_number(&self) -> Result<u64, RpcError>;

    /// Retrieve the block at `height` and persist its raw payload. The
    /// payload is durable by the time this returns Ok.
    async fn fetch(&self, height: u64) -> Result<(), FetchError>;
}

/// Builds a client for a descriptor, or explains why the chain cannot be
/// served this pass.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, descriptor: &ChainDescriptor)
    -> Result<Arc<dyn ChainClient>, SkipReason>;
}

pub struct RpcClientFactory {
    store: Arc<ChainStore>,
    http: reqwest::Client,
}

impl RpcClientFactory {
    #[must_use]
    pub fn new(store: Arc<ChainStore>) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
        }
    }
}

impl ClientFactory for RpcClientFactory {
    fn client_for(
        &self,
        descriptor: &ChainDescriptor,
    ) -> Result<Arc<dyn ChainClient>, SkipReason> {
        let kind = ClientKind::from_name(&descriptor.client_kind)
            .ok_or(SkipReason::UnknownClientKind)?;
        match kind {
            ClientKind::Evm => {
                let endpoint =
                    Url::parse(&descriptor.endpoint).map_err(SkipReason::InvalidEndpoint)?;
                Ok(Arc::new(EvmRpcClient {
                    chain_id: descriptor.id,
                    endpoint,
                    http: self.http.clone(),
                    store: Arc::clone(&self.store),
                    next_id: AtomicU64::new(1),
                }))
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcReq<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: &'a [serde_json::Value],
}

#[derive(Debug, Deserialize)]
struct JsonRpcResp {
    /// An explicit JSON `null` (e.g. a not-yet-mined block) must stay
    /// distinguishable from a protocol error, so this is a plain Value.
    #[serde(default)]
    result: serde_json::Value,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// JSON-RPC client for EVM-style nodes. Raw block payloads land in the
/// store's blob directory under `blocks/<chain_id>/<height>.json`.
pub struct EvmRpcClient {
    chain_id: u64,
    endpoint: Url,
    http: reqwest::Client,
    store: Arc<ChainStore>,
    next_id: AtomicU64,
}

impl EvmRpcClient {
    async fn call(
        &self,
        method: &'static str,
        params: &[serde_json::Value],
    ) -> Result<serde_json::Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcReq {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let resp = self
            .http
            .post(self.endpoint.clone())
            .json(&req)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RpcError::HttpStatus { status, body });
        }

        let parsed: JsonRpcResp = resp.json().await.map_err(RpcError::JsonDecode)?;
        if let Some(err) = parsed.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }
        Ok(parsed.result)
    }
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        let result = self.call("eth_blockNumber", &[]).await?;
        if result.is_null() {
            return Err(RpcError::MissingResult);
        }
        let quantity = result
            .as_str()
            .ok_or_else(|| RpcError::MalformedQuantity(result.to_string()))?;
        parse_quantity(quantity)
    }

    async fn fetch(&self, height: u64) -> Result<(), FetchError> {
        let params = [
            serde_json::Value::String(format!("{height:#x}")),
            serde_json::Value::Bool(true),
        ];
        let block = self.call("eth_getBlockByNumber", &params).await?;
        if block.is_null() {
            return Err(FetchError::MissingBlock { height });
        }

        let kind = format!("blocks/{}", self.chain_id);
        self.store.ensure_blob_dir(&kind)?;
        let path = self.store.blob_path(&kind, &format!("{height}.json"));
        std::fs::write(&path, serde_json::to_vec(&block).map_err(std::io::Error::other)?)?;
        Ok(())
    }
}

fn parse_quantity(quantity: &str) -> Result<u64, RpcError> {
    let digits = quantity
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::MalformedQuantity(quantity.to_string()))?;
    u64::from_str_radix(digits, 16)
        .map_err(|_| RpcError::MalformedQuantity(quantity.to_string()))
}
