//! 远程数据源
//!
//! 链上只读访问的抽象边界：
//! - 拉取未知地址的构建文件（ABI + 合约名）
//! - 执行只读调用（`eth_call`）
//! - 读取存储槽位（`eth_getStorageAt`）

mod jsonrpc;
mod memory;

pub use jsonrpc::JsonRpcSource;
pub use memory::InMemorySource;

use crate::error::RemoteError;
use crate::types::{Address, BuildFile, StorageSlot};
use async_trait::async_trait;

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// 拉取地址的构建文件
    async fn fetch_build_file(&self, network: &str, address: Address) -> RemoteResult<BuildFile>;

    /// 只读调用，返回原始返回数据
    async fn call(&self, address: Address, calldata: &[u8]) -> RemoteResult<Vec<u8>>;

    /// 读取存储槽位
    async fn storage_at(&self, address: Address, slot: StorageSlot) -> RemoteResult<StorageSlot>;
}
