//! 合约句柄
//!
//! 把别名表和代理表变成可调用的句柄。代理别名绑定代理地址，
//! 但使用实现合约的 ABI 编码和校验调用。

use crate::codec::{decode_address, encode_call};
use crate::error::{Error, Result};
use crate::import::Importer;
use crate::remote::RemoteSource;
use crate::store::StoreObserver;
use crate::types::{normalize_signature, Abi, Address, Alias, AliasMap, ProxyMap};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 可调用的合约句柄
#[derive(Clone)]
pub struct ContractHandle {
    pub alias: Alias,
    /// 调用目标地址（代理时为代理地址）
    pub address: Address,
    pub contract_name: String,
    pub abi: Abi,
    /// 代理的实现合约地址
    pub implementation: Option<Address>,
    source: Arc<dyn RemoteSource>,
}

impl fmt::Debug for ContractHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractHandle")
            .field("alias", &self.alias)
            .field("address", &self.address)
            .field("contract_name", &self.contract_name)
            .field("functions", &self.abi.functions().count())
            .field("implementation", &self.implementation)
            .finish()
    }
}

impl ContractHandle {
    pub fn is_proxy(&self) -> bool {
        self.implementation.is_some()
    }

    pub fn has_function(&self, signature: &str) -> bool {
        self.abi.has_function(signature)
    }

    /// 只读调用，签名必须出现在 ABI 中
    pub async fn call(&self, signature: &str, args: &[[u8; 32]]) -> Result<Vec<u8>> {
        if !self.has_function(signature) {
            return Err(Error::UnknownFunction(format!(
                "{}.{}",
                self.alias,
                normalize_signature(signature)
            )));
        }
        Ok(self.source.call(self.address, &encode_call(signature, args)).await?)
    }

    /// 调用返回地址的访问器
    pub async fn call_address(&self, signature: &str) -> Result<Address> {
        let ret = self.call(signature, &[]).await?;
        decode_address(&ret).ok_or_else(|| {
            Error::RemoteError(crate::error::RemoteError::Malformed(format!(
                "{} 返回的不是地址",
                signature
            )))
        })
    }
}

/// 别名 -> 句柄
pub type ContractMap = BTreeMap<Alias, ContractHandle>;

/// 构建句柄表
///
/// 每个别名需要一个构建文件，构建文件已缓存时不会产生远程请求。
pub async fn materialize(
    importer: &Importer,
    network: &str,
    aliases: &AliasMap,
    proxies: &ProxyMap,
) -> Result<ContractMap> {
    let mut contracts = ContractMap::new();
    for (alias, address) in aliases {
        let proxy = proxies.get(alias).filter(|p| p.proxy == *address);
        let abi_address = proxy.map(|p| p.implementation).unwrap_or(*address);
        let build = importer.import(network, abi_address).await?;
        contracts.insert(
            alias.clone(),
            ContractHandle {
                alias: alias.clone(),
                address: *address,
                contract_name: build.contract_name,
                abi: build.abi,
                implementation: proxy.map(|p| p.implementation),
                source: importer.source().clone(),
            },
        );
    }
    debug!(network, count = contracts.len(), "materialized contracts");
    Ok(contracts)
}

/// 会话级句柄缓存，存储修改时失效
#[derive(Default)]
pub struct ContractsMemo {
    slot: Mutex<Option<Arc<ContractMap>>>,
    generation: AtomicU64,
}

impl ContractsMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<ContractMap>> {
        self.slot.lock().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// 仅当构建期间没有发生失效时才写入
    pub fn set(&self, generation: u64, contracts: Arc<ContractMap>) -> bool {
        let mut slot = self.slot.lock();
        if self.generation() != generation {
            return false;
        }
        *slot = Some(contracts);
        true
    }
}

impl StoreObserver for ContractsMemo {
    fn invalidate(&self) {
        let mut slot = self.slot.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        *slot = None;
    }
}
