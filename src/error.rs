//! 错误类型定义

use crate::types::Address;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("导入合约失败: {network}/{address} 共尝试 {attempts} 次, 最后错误: {last_error}")]
    ImportFailure {
        network: String,
        address: Address,
        attempts: u32,
        last_error: RemoteError,
    },

    #[error("读取关系失败: {address} 的关系 '{relation}' 共尝试 {attempts} 次, 最后错误: {last_error}")]
    RelationUnavailable {
        address: Address,
        relation: String,
        attempts: u32,
        last_error: RemoteError,
    },

    #[error("遍历在 '{alias}' ({address}) 处失败, 该节点由 '{parent}' 的关系 '{relation}' 发现: {source}")]
    SpiderFailure {
        alias: String,
        address: Address,
        parent: String,
        relation: String,
        source: Box<Error>,
    },

    #[error(
        "别名冲突: '{alias}' 已指向 {existing}, 关系 '{relation}' 又将其指向 {conflicting}"
    )]
    RelationAmbiguity {
        alias: String,
        existing: Address,
        conflicting: Address,
        relation: String,
    },

    #[error("运行已取消")]
    Cancelled,

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("ABI 中不存在函数: {0}")]
    UnknownFunction(String),

    #[error("无效的地址格式: {0}")]
    InvalidAddress(String),

    #[error("存储错误: {0}")]
    StorageError(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("远程调用错误: {0}")]
    RemoteError(#[from] RemoteError),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerializationError(String),

    #[error("内部错误: {0}")]
    InternalError(String),
}

impl Error {
    /// 去掉遍历上下文后的底层错误
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::SpiderFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

/// 远程数据源错误（RPC / 区块浏览器）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("请求超时")]
    Timeout,

    #[error("触发限流")]
    RateLimited,

    #[error("调用回滚: {0}")]
    Reverted(String),

    #[error("响应格式错误: {0}")]
    Malformed(String),

    #[error("合约源码未验证")]
    NotVerified,

    #[error("传输错误: {0}")]
    Transport(String),
}

impl RemoteError {
    /// 回滚是合约语义上的结果，重试没有意义
    pub fn is_revert(&self) -> bool {
        matches!(self, RemoteError::Reverted(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if e.status().map(|s| s.as_u16()) == Some(429) {
            RemoteError::RateLimited
        } else if e.is_decode() {
            RemoteError::Malformed(e.to_string())
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

/// 持久化写入失败的告警（内存状态仍然有效）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWriteWarning {
    pub path: std::path::PathBuf,
    pub message: String,
}

impl std::fmt::Display for CacheWriteWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "缓存写入失败 {:?}: {}", self.path, self.message)
    }
}
