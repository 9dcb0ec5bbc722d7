//! 配置
//!
//! 部署管理器的配置文件（JSON），所有字段都有默认值。

use crate::error::{Error, Result};
use crate::import::{Backoff, RetryPolicy};
use crate::relation::RelationConfigSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 单个网络的远程访问配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub rpc_url: String,
    #[serde(default)]
    pub explorer_api_url: Option<String>,
    #[serde(default)]
    pub explorer_api_key: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    15_000
}

/// 部署管理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// 缓存根目录
    pub base_dir: PathBuf,
    /// 导入失败后的重试次数
    pub import_retries: u32,
    /// 重试间隔（毫秒）
    pub import_retry_delay_ms: u64,
    pub import_backoff: Backoff,
    /// 是否将缓存同步写入磁盘
    pub write_cache_to_disk: bool,
    /// 遍历最大深度
    pub max_depth: usize,
    /// 远程调用并发上限
    pub concurrency: usize,
    /// 覆盖部署名到网络名的映射
    pub network: Option<String>,
    pub relations: RelationConfigSet,
    pub networks: HashMap<String, NetworkConfig>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("deployments"),
            import_retries: 3,
            import_retry_delay_ms: 2000,
            import_backoff: Backoff::Fixed,
            write_cache_to_disk: false,
            max_depth: 16,
            concurrency: 8,
            network: None,
            relations: RelationConfigSet::default(),
            networks: HashMap::new(),
        }
    }
}

impl DeploymentConfig {
    /// 从 JSON 文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|e| Error::ConfigError(format!("读取配置 {:?} 失败: {}", path, e)))?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| Error::ConfigError(format!("解析配置 {:?} 失败: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::ConfigError("concurrency 必须大于 0".to_string()));
        }
        if self.max_depth == 0 {
            return Err(Error::ConfigError("max_depth 必须大于 0".to_string()));
        }
        self.relations.validate()
    }

    /// 部署名即网络名，除非显式覆盖
    pub fn network_for(&self, deployment: &str) -> String {
        self.network.clone().unwrap_or_else(|| deployment.to_string())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.import_retries,
            delay: Duration::from_millis(self.import_retry_delay_ms),
            backoff: self.import_backoff.clone(),
        }
    }

    pub fn network_config(&self, network: &str) -> Result<&NetworkConfig> {
        self.networks
            .get(network)
            .ok_or_else(|| Error::ConfigError(format!("网络 {} 未配置 RPC", network)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = DeploymentConfig::default();
        assert_eq!(config.import_retries, 3);
        assert_eq!(config.import_retry_delay_ms, 2000);
        assert!(!config.write_cache_to_disk);
        assert_eq!(config.network_for("mainnet"), "mainnet");
        assert_eq!(config.retry_policy().delay, Duration::from_secs(2));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "base_dir": "/tmp/deployments",
                "import_retries": 5,
                "network": "goerli",
                "networks": {{ "goerli": {{ "rpc_url": "http://localhost:8545" }} }},
                "relations": {{
                    "default": [
                        {{ "name": "comet", "requires": ["baseToken()"],
                           "relations": [{{ "relation": "baseToken", "extract": {{ "type": "call", "method": "baseToken()" }} }}] }}
                    ]
                }}
            }}"#
        )
        .unwrap();

        let config = DeploymentConfig::load(file.path()).unwrap();
        assert_eq!(config.import_retries, 5);
        assert_eq!(config.import_retry_delay_ms, 2000);
        assert_eq!(config.network_for("goerli-staging"), "goerli");
        assert_eq!(config.network_config("goerli").unwrap().timeout_ms, 15_000);
        assert!(config.network_config("mainnet").is_err());
        assert_eq!(config.relations.for_network("goerli").len(), 1);
    }

    #[test]
    fn test_invalid_concurrency() {
        let config = DeploymentConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }
}
