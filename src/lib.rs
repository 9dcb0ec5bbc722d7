//! contract-spider - 合约部署状态管理
//!
//! 跟踪一个部署中各地址扮演的逻辑角色，支持：
//! - 从根地址出发遍历链上关系，自动发现别名和代理
//! - 按 (network, address) 缓存构建文件，重复运行不产生远程请求
//! - 单调合并的别名表 / 代理表，只在运行成功后提交
//! - 代理别名使用实现合约 ABI 的合约句柄

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod import;
pub mod manager;
pub mod materializer;
pub mod metrics;
pub mod printer;
pub mod relation;
pub mod remote;
pub mod spider;
pub mod store;
pub mod types;

// 重导出常用类型
pub use config::DeploymentConfig;
pub use error::{CacheWriteWarning, Error, RemoteError, Result};
pub use manager::DeploymentManager;
pub use materializer::{ContractHandle, ContractMap};
pub use relation::{ContractKind, RelationConfigSet, RelationRule};
pub use remote::{InMemorySource, JsonRpcSource, RemoteSource};
pub use spider::{CancelToken, MergeMode, SpiderOptions, SpiderReport};
pub use types::{Address, Alias, AliasMap, BuildFile, ProxyMap, ProxyRecord, Roots};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
