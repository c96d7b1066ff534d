//! bitcoind JSON-RPC adapter.
//!
//! Uses `getblockcount`, `getblockhash` + `getblock(hash, 1)`,
//! `getrawtransaction(hash, true)`, and `getrawmempool`. There is no retry
//! here: every failure surfaces as [`IndexerError::Rpc`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use bitsync_core::error::IndexerError;
use bitsync_core::source::ChainSource;
use bitsync_core::types::{BlockData, TxRecord};

use crate::tna;

/// Connection settings for a bitcoind node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// e.g. `http://127.0.0.1:8332`
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".into(),
            user: None,
            password: None,
            timeout_ms: 30_000,
        }
    }
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

/// bitcoind omits `jsonrpc` in 1.0 replies.
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

impl RpcResponse {
    fn into_result(self, method: &str) -> Result<Value, IndexerError> {
        match self.error {
            Some(err) => Err(IndexerError::Rpc(format!(
                "{method}: error {}: {}",
                err.code, err.message
            ))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

/// HTTP JSON-RPC client for bitcoind.
pub struct BitcoindRpc {
    url: String,
    http: reqwest::Client,
    user: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
}

impl BitcoindRpc {
    pub fn new(config: RpcConfig) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| IndexerError::Config(format!("http client: {e}")))?;

        Ok(Self {
            url: config.url,
            http,
            user: config.user,
            password: config.password,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue one call and return its `result`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, IndexerError> {
        let req = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let mut builder = self.http.post(&self.url).json(&req);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_ref());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| IndexerError::Rpc(format!("{method}: {e}")))?;

        // bitcoind reports RPC errors with HTTP 500 and a JSON body
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| IndexerError::Rpc(format!("{method}: {e}")))?;

        match serde_json::from_str::<RpcResponse>(&body) {
            Ok(parsed) => parsed.into_result(method),
            Err(_) if !status.is_success() => Err(IndexerError::Rpc(format!(
                "{method}: HTTP {}: {body}",
                status.as_u16()
            ))),
            Err(e) => Err(IndexerError::Rpc(format!("{method}: bad response: {e}"))),
        }
    }
}

fn expect_str(v: &Value, what: &str) -> Result<String, IndexerError> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| IndexerError::Rpc(format!("{what}: expected string, got {v}")))
}

#[async_trait]
impl ChainSource for BitcoindRpc {
    async fn current_height(&self) -> Result<u64, IndexerError> {
        let v = self.call("getblockcount", json!([])).await?;
        v.as_u64()
            .ok_or_else(|| IndexerError::Rpc(format!("getblockcount: unexpected {v}")))
    }

    async fn block_at(&self, height: u64) -> Result<BlockData, IndexerError> {
        let hash = expect_str(&self.call("getblockhash", json!([height])).await?, "getblockhash")?;
        let block = self.call("getblock", json!([hash, 1])).await?;
        parse_block(&block)
    }

    async fn transaction(&self, hash: &str) -> Result<TxRecord, IndexerError> {
        let raw = self.call("getrawtransaction", json!([hash, true])).await?;
        tna::to_record(&raw)
    }

    async fn mempool_txids(&self) -> Result<Vec<String>, IndexerError> {
        let v = self.call("getrawmempool", json!([])).await?;
        v.as_array()
            .ok_or_else(|| IndexerError::Rpc(format!("getrawmempool: unexpected {v}")))?
            .iter()
            .map(|id| expect_str(id, "getrawmempool"))
            .collect()
    }
}

/// Parse a `getblock(hash, 1)` result.
pub fn parse_block(v: &Value) -> Result<BlockData, IndexerError> {
    let txids: Vec<String> = v["tx"]
        .as_array()
        .ok_or_else(|| IndexerError::Rpc("getblock: missing tx list".into()))?
        .iter()
        .map(|id| expect_str(id, "getblock.tx"))
        .collect::<Result<_, _>>()?;

    Ok(BlockData {
        hash: expect_str(&v["hash"], "getblock.hash")?,
        time: v["time"]
            .as_i64()
            .ok_or_else(|| IndexerError::Rpc("getblock: missing time".into()))?,
        txids,
    })
}
