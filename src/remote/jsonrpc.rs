//! JSON-RPC 节点 + Etherscan 兼容浏览器数据源

use super::{RemoteResult, RemoteSource};
use crate::config::NetworkConfig;
use crate::error::RemoteError;
use crate::types::{Abi, Address, BuildFile, StorageSlot};
use alloy::primitives::{Bytes, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use alloy::transports::http::{Client, Http};
use alloy::transports::TransportResult;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::future::IntoFuture;
use std::time::Duration;
use tracing::debug;

type HttpProvider = RootProvider<Http<Client>>;

#[derive(Deserialize)]
struct ExplorerResponse {
    status: String,
    #[serde(default)]
    message: String,
    result: Value,
}

#[derive(Deserialize)]
struct SourceCodeEntry {
    #[serde(rename = "ContractName", default)]
    contract_name: String,
    #[serde(rename = "ABI", default)]
    abi: String,
    #[serde(rename = "CompilerVersion", default)]
    compiler_version: String,
}

/// 基于 HTTP 的远程数据源
pub struct JsonRpcSource {
    provider: HttpProvider,
    client: reqwest::Client,
    timeout: Duration,
    explorer_api_url: Option<String>,
    explorer_api_key: Option<String>,
}

impl JsonRpcSource {
    pub fn new(config: &NetworkConfig) -> RemoteResult<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let rpc_url: reqwest::Url = config.rpc_url.parse().map_err(|e| {
            RemoteError::Transport(format!("无效的 RPC 地址 {}: {}", config.rpc_url, e))
        })?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            provider: ProviderBuilder::new().on_http(rpc_url),
            client,
            timeout,
            explorer_api_url: config.explorer_api_url.clone(),
            explorer_api_key: config.explorer_api_key.clone(),
        })
    }

    /// 带超时执行一次节点请求
    async fn request<T, F>(&self, request: F) -> RemoteResult<T>
    where
        F: IntoFuture<Output = TransportResult<T>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(|e| classify_rpc_error(&e.to_string())),
            Err(_) => Err(RemoteError::Timeout),
        }
    }
}

/// 按节点返回的错误消息分类
fn classify_rpc_error(message: &str) -> RemoteError {
    let msg = message.to_ascii_lowercase();
    if msg.contains("revert") {
        RemoteError::Reverted(message.to_string())
    } else if msg.contains("429")
        || msg.contains("rate limit")
        || msg.contains("too many requests")
        || msg.contains("compute units per second")
    {
        RemoteError::RateLimited
    } else if msg.contains("timed out") || msg.contains("timeout") {
        RemoteError::Timeout
    } else if msg.contains("deserialization error") || msg.contains("parse error") {
        RemoteError::Malformed(message.to_string())
    } else {
        RemoteError::Transport(message.to_string())
    }
}

#[async_trait]
impl RemoteSource for JsonRpcSource {
    async fn fetch_build_file(&self, network: &str, address: Address) -> RemoteResult<BuildFile> {
        let base = self.explorer_api_url.as_deref().ok_or_else(|| {
            RemoteError::Transport(format!("网络 {} 未配置区块浏览器 API", network))
        })?;
        let mut query = vec![
            ("module", "contract".to_string()),
            ("action", "getsourcecode".to_string()),
            ("address", address.to_hex()),
        ];
        if let Some(key) = &self.explorer_api_key {
            query.push(("apikey", key.clone()));
        }

        debug!(network, %address, "explorer getsourcecode");
        let resp = self
            .client
            .get(base)
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        let body: ExplorerResponse = resp.json().await?;

        if body.status != "1" {
            let text = body.result.as_str().unwrap_or(body.message.as_str()).to_lowercase();
            if text.contains("rate limit") {
                return Err(RemoteError::RateLimited);
            }
            return Err(RemoteError::Malformed(format!("浏览器返回错误: {}", text)));
        }

        let entries: Vec<SourceCodeEntry> = serde_json::from_value(body.result)
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Malformed("空的 getsourcecode 结果".to_string()))?;
        if entry.abi.starts_with("Contract source code not verified") {
            return Err(RemoteError::NotVerified);
        }
        let abi: Abi =
            serde_json::from_str(&entry.abi).map_err(|e| RemoteError::Malformed(e.to_string()))?;

        Ok(BuildFile {
            contract_name: entry.contract_name,
            abi,
            compiler_version: Some(entry.compiler_version).filter(|v| !v.is_empty()),
        })
    }

    async fn call(&self, address: Address, calldata: &[u8]) -> RemoteResult<Vec<u8>> {
        debug!(%address, "eth_call");
        let tx = TransactionRequest::default()
            .to(address.into())
            .input(TransactionInput::new(Bytes::copy_from_slice(calldata)));
        let ret = self.request(self.provider.call(&tx)).await?;
        Ok(ret.to_vec())
    }

    async fn storage_at(&self, address: Address, slot: StorageSlot) -> RemoteResult<StorageSlot> {
        debug!(%address, %slot, "eth_getStorageAt");
        let key = U256::from_be_bytes(slot.to_fixed_bytes());
        let value = self
            .request(self.provider.get_storage_at(address.into(), key))
            .await?;
        Ok(StorageSlot::from(value.to_be_bytes::<32>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rpc_error() {
        assert!(classify_rpc_error(
            "server returned an error response: error code 3: execution reverted: Ownable: caller is not owner"
        )
        .is_revert());
        assert_eq!(
            classify_rpc_error("HTTP error 429 with body: your app exceeded compute units per second capacity"),
            RemoteError::RateLimited
        );
        assert_eq!(classify_rpc_error("operation timed out"), RemoteError::Timeout);
        assert!(matches!(
            classify_rpc_error("error sending request for url"),
            RemoteError::Transport(_)
        ));
    }

    #[test]
    fn test_invalid_rpc_url() {
        let config: NetworkConfig =
            serde_json::from_value(serde_json::json!({ "rpc_url": "not a url" })).unwrap();
        assert!(matches!(
            JsonRpcSource::new(&config),
            Err(RemoteError::Transport(_))
        ));
    }

    #[test]
    fn test_source_code_entry_shape() {
        let body: ExplorerResponse = serde_json::from_str(
            r#"{"status":"1","message":"OK","result":[{"ContractName":"Comet","ABI":"[{\"type\":\"function\",\"name\":\"baseToken\",\"inputs\":[],\"outputs\":[{\"name\":\"\",\"type\":\"address\"}]}]","CompilerVersion":"v0.8.15"}]}"#,
        )
        .unwrap();
        let entries: Vec<SourceCodeEntry> = serde_json::from_value(body.result).unwrap();
        let abi: Abi = serde_json::from_str(&entries[0].abi).unwrap();
        assert_eq!(entries[0].contract_name, "Comet");
        assert!(abi.has_function("baseToken()"));
    }
}
